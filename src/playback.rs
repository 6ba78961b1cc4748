use crate::ingest::{concat_batch, decode_pcm16, AudioFragment, IngestQueue};
use crate::output::{AudioOutput, PlaybackSession};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

const LOG: &str = "voicelink::playback";

/// Commands consumed by the playback engine task.
#[derive(Debug)]
pub enum EngineCmd {
    Fragment(AudioFragment),
    /// Stop the active session and discard everything queued.
    Flush,
    Shutdown,
}

/// Cloneable push/flush surface used by the dispatcher and the public API.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl PlaybackHandle {
    /// Queue one arrived fragment. This is the edge trigger: the engine
    /// wakes on the channel immediately.
    pub fn push(&self, fragment: AudioFragment) {
        let _ = self.tx.send(EngineCmd::Fragment(fragment));
    }

    pub fn flush(&self) {
        let _ = self.tx.send(EngineCmd::Flush);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCmd::Shutdown);
    }
}

/// Drains the ingest queue in whole batches, decodes to normalized
/// samples, and drives strictly sequential gapless playback sessions.
pub struct PlaybackEngine {
    rx: mpsc::UnboundedReceiver<EngineCmd>,
    output: Box<dyn AudioOutput>,
    poll_interval: Duration,
}

enum Flow {
    Continue,
    Stop,
}

impl PlaybackEngine {
    pub fn new(output: Box<dyn AudioOutput>, poll_interval: Duration) -> (Self, PlaybackHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                output,
                poll_interval,
            },
            PlaybackHandle { tx },
        )
    }

    pub async fn run(self) {
        let PlaybackEngine {
            mut rx,
            mut output,
            poll_interval,
        } = self;
        let mut queue = IngestQueue::new();
        let mut session: Option<PlaybackSession> = None;
        // Level-triggered backstop: re-attempts playback even if an edge
        // trigger was missed while a batch was in flight.
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let mut flow = match cmd {
                        Some(cmd) => handle_cmd(cmd, &mut queue, &mut session),
                        None => Flow::Stop,
                    };
                    // Pull the rest of a burst before attempting playback
                    // so simultaneous arrivals land in one batch.
                    while matches!(flow, Flow::Continue) {
                        match rx.try_recv() {
                            Ok(cmd) => flow = handle_cmd(cmd, &mut queue, &mut session),
                            Err(_) => break,
                        }
                    }
                    if matches!(flow, Flow::Stop) {
                        break;
                    }
                }
                _ = poll.tick() => {}
                outcome = wait_done(&mut session), if session.is_some() => {
                    if outcome.is_err() {
                        log::warn!(target: LOG, "playback session ended without completing");
                    }
                    session = None;
                    // Fall through to the queue re-check: a batch that
                    // accumulated during playback starts with no gap.
                }
            }
            try_start(&mut queue, &mut session, output.as_mut());
        }

        // Teardown: force-stop anything still playing.
        drop(session.take());
    }
}

fn handle_cmd(
    cmd: EngineCmd,
    queue: &mut IngestQueue,
    session: &mut Option<PlaybackSession>,
) -> Flow {
    match cmd {
        EngineCmd::Fragment(fragment) => {
            queue.push(fragment);
            Flow::Continue
        }
        EngineCmd::Flush => {
            if let Some(active) = session.take() {
                log::debug!(target: LOG, "interrupt: stopping active session");
                drop(active);
            }
            let discarded = queue.len();
            queue.clear();
            if discarded > 0 {
                log::debug!(target: LOG, "interrupt: discarded {} queued fragments", discarded);
            }
            Flow::Continue
        }
        EngineCmd::Shutdown => Flow::Stop,
    }
}

async fn wait_done(session: &mut Option<PlaybackSession>) -> Result<(), oneshot::error::RecvError> {
    match session.as_mut() {
        Some(active) => (&mut active.done).await,
        None => std::future::pending().await,
    }
}

fn try_start(
    queue: &mut IngestQueue,
    session: &mut Option<PlaybackSession>,
    output: &mut dyn AudioOutput,
) {
    if session.is_some() || queue.is_empty() {
        return;
    }
    let batch = queue.take_all();
    let bytes = concat_batch(&batch);
    let samples = match decode_pcm16(&bytes) {
        Ok(samples) => samples,
        Err(e) => {
            log::warn!(target: LOG, "abandoning batch of {} fragments: {}", batch.len(), e);
            return;
        }
    };
    if samples.is_empty() {
        return;
    }
    match output.begin(samples) {
        Ok(started) => *session = Some(started),
        Err(e) => log::warn!(target: LOG, "failed to start playback: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutputError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct BegunSession {
        samples: Vec<f32>,
        done: Option<oneshot::Sender<()>>,
        stopped: Arc<AtomicBool>,
    }

    /// Records every begun session; tests complete or inspect them.
    #[derive(Clone, Default)]
    struct TestOutput {
        begun: Arc<Mutex<Vec<BegunSession>>>,
    }

    struct FlagGuard(Arc<AtomicBool>);

    impl Drop for FlagGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl AudioOutput for TestOutput {
        fn begin(&mut self, samples: Vec<f32>) -> Result<PlaybackSession, OutputError> {
            let (done_tx, done_rx) = oneshot::channel();
            let stopped = Arc::new(AtomicBool::new(false));
            self.begun.lock().unwrap().push(BegunSession {
                samples,
                done: Some(done_tx),
                stopped: stopped.clone(),
            });
            Ok(PlaybackSession::new(done_rx, Box::new(FlagGuard(stopped))))
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn normalized(samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    fn spawn_engine() -> (Arc<Mutex<Vec<BegunSession>>>, PlaybackHandle) {
        let output = TestOutput::default();
        let begun = output.begun.clone();
        let (engine, handle) = PlaybackEngine::new(Box::new(output), Duration::from_millis(50));
        tokio::spawn(engine.run());
        (begun, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_fragments_plays_as_one_ordered_batch() {
        let (begun, handle) = spawn_engine();
        handle.push(AudioFragment::new(pcm(&[1, 2])));
        handle.push(AudioFragment::new(pcm(&[3])));
        handle.push(AudioFragment::new(pcm(&[4])));
        settle().await;

        let sessions = begun.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].samples, normalized(&[1, 2, 3, 4]));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_session_arrivals_continue_gapless_with_no_loss() {
        let (begun, handle) = spawn_engine();
        handle.push(AudioFragment::new(pcm(&[10])));
        settle().await;
        assert_eq!(begun.lock().unwrap().len(), 1);

        handle.push(AudioFragment::new(pcm(&[20])));
        handle.push(AudioFragment::new(pcm(&[30])));
        settle().await;
        // Sessions are strictly sequential, never overlapped.
        assert_eq!(begun.lock().unwrap().len(), 1);

        let done = begun.lock().unwrap()[0].done.take().unwrap();
        done.send(()).unwrap();
        settle().await;

        let sessions = begun.lock().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].samples, normalized(&[10]));
        assert_eq!(sessions[1].samples, normalized(&[20, 30]));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_stops_the_session_and_empties_the_queue() {
        let (begun, handle) = spawn_engine();
        handle.push(AudioFragment::new(pcm(&[1])));
        settle().await;
        handle.push(AudioFragment::new(pcm(&[2])));
        handle.push(AudioFragment::new(pcm(&[3])));
        handle.flush();
        settle().await;

        {
            let sessions = begun.lock().unwrap();
            assert_eq!(sessions.len(), 1);
            assert!(sessions[0].stopped.load(Ordering::SeqCst));
        }

        // A fresh push starts a clean idle-to-playing cycle: nothing from
        // before the interrupt leaks through.
        handle.push(AudioFragment::new(pcm(&[7])));
        settle().await;
        let sessions = begun.lock().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].samples, normalized(&[7]));
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_batch_is_abandoned_without_blocking_later_ones() {
        let (begun, handle) = spawn_engine();
        handle.push(AudioFragment::new(vec![0, 1, 2]));
        settle().await;
        assert_eq!(begun.lock().unwrap().len(), 0);

        handle.push(AudioFragment::new(pcm(&[5])));
        settle().await;
        let sessions = begun.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].samples, normalized(&[5]));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fragments_do_not_start_a_session() {
        let (begun, handle) = spawn_engine();
        handle.push(AudioFragment::new(Vec::new()));
        settle().await;
        assert_eq!(begun.lock().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_while_idle_is_a_no_op() {
        let (begun, handle) = spawn_engine();
        handle.flush();
        settle().await;
        handle.push(AudioFragment::new(pcm(&[1])));
        settle().await;
        assert_eq!(begun.lock().unwrap().len(), 1);
    }
}
