use voicelink::{Channel, ChannelConfig, ChannelEvent, CpalOutput};

#[tokio::main]
async fn main() {
    env_logger::init();

    let url = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOICELINK_URL").ok())
    {
        Some(url) => url,
        None => {
            eprintln!("usage: voicelink <ws-url>  (or set VOICELINK_URL)");
            std::process::exit(2);
        }
    };

    let mut config = ChannelConfig::new(url);
    if let Ok(raw) = std::env::var("VOICELINK_SETUP") {
        match serde_json::from_str(&raw) {
            Ok(setup) => config.setup = setup,
            Err(e) => {
                eprintln!("invalid VOICELINK_SETUP json: {}", e);
                std::process::exit(2);
            }
        }
    }

    let output = CpalOutput::new(config.sample_rate);
    let (channel, mut events) = Channel::spawn(config, Box::new(output));
    channel.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                channel.shutdown();
                break;
            }
            event = events.recv() => match event {
                Some(ChannelEvent::State(state)) => println!("[voicelink] state: {:?}", state),
                Some(ChannelEvent::Text(text)) => println!("[voicelink] {}", text),
                None => break,
            }
        }
    }
}
