//! Host side of the mbed host-test protocol.
//!
//! The host opens a session by sending `{{__sync;<id>}}` until the DUT
//! echoes the same id back. From then on the DUT drives the test with
//! `{{key;value}}` messages. A [`HostTest`] registers a callback per key it
//! understands; the runner dispatches incoming messages, sends replies back
//! and tracks the verdict. A handful of keys are handled by the runner
//! itself:
//!
//! | key                | action                                   |
//! |--------------------|------------------------------------------|
//! | `__sync`           | ignored once synchronised                |
//! | `__version`        | logged                                   |
//! | `__timeout`        | overall timeout, in seconds              |
//! | `__host_test_name` | logged                                   |
//! | `end`              | DUT verdict, `success` or anything else  |
//! | `__exit`           | stop                                     |

use crate::dut::{DutLink, LinkEvent};
use crate::error::Result;
use crate::transcript::SharedTranscript;
use busprobe_decode::KvMessage;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub value: String,
    pub timestamp: Instant,
}

/// What a callback can do besides returning an error.
#[derive(Debug, Default)]
pub struct HostContext {
    outbox: Vec<KvMessage>,
    verdict: Option<bool>,
}

impl HostContext {
    pub fn send_kv(&mut self, key: &str, value: &str) {
        self.outbox.push(KvMessage::new(key, value));
    }

    /// Ends the test with the given result.
    pub fn notify_complete(&mut self, result: bool) {
        self.verdict = Some(result);
    }

    pub fn verdict(&self) -> Option<bool> {
        self.verdict
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<KvMessage> {
        std::mem::take(&mut self.outbox)
    }
}

pub type Callback<T> = fn(&mut T, &KvEvent, &mut HostContext) -> Result<()>;

pub struct Registry<T> {
    callbacks: HashMap<String, Callback<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { callbacks: HashMap::new() }
    }
}

impl<T> Registry<T> {
    pub fn register_callback(&mut self, key: &str, callback: Callback<T>) {
        if self.callbacks.insert(key.to_string(), callback).is_some() {
            log::warn!("callback for '{key}' registered twice, keeping the last one");
        }
    }

    pub fn get(&self, key: &str) -> Option<Callback<T>> {
        self.callbacks.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }
}

pub trait HostTest: Sized {
    fn name(&self) -> &str;

    /// Acquires resources and registers callbacks. Failures that should
    /// fail the test go through `ctx.notify_complete(false)`.
    fn setup(&mut self, registry: &mut Registry<Self>, ctx: &mut HostContext) -> Result<()>;

    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Message transport to the DUT.
pub trait KvLink {
    fn send(&mut self, msg: KvMessage) -> Result<()>;
    fn events(&self) -> &Receiver<LinkEvent>;
}

impl KvLink for DutLink {
    fn send(&mut self, msg: KvMessage) -> Result<()> {
        DutLink::send(self, msg)
    }

    fn events(&self) -> &Receiver<LinkEvent> {
        DutLink::events(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Pass,
    Fail,
    Timeout,
}

/// Interval between `__sync` messages while the DUT has not answered.
const SYNC_RETRY: Duration = Duration::from_secs(1);

/// Session id for the `__sync` handshake, unique per run.
fn sync_token() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let token = nanos ^ (u128::from(std::process::id()) << 96);
    let hex = format!("{token:032x}");
    format!("{}-{}-{}-{}-{}", &hex[..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..])
}

pub struct HostTestRunner<L> {
    link: L,
    timeout: Duration,
    sync_retry: Duration,
    transcript: SharedTranscript,
}

impl<L: KvLink> HostTestRunner<L> {
    pub fn new(link: L, timeout: Duration, transcript: SharedTranscript) -> Self {
        Self { link, timeout, sync_retry: SYNC_RETRY, transcript }
    }

    pub fn into_link(self) -> L {
        self.link
    }

    pub fn run<T: HostTest>(&mut self, test: &mut T) -> Result<TestOutcome> {
        let mut registry = Registry::default();
        let mut ctx = HostContext::default();

        if let Err(e) = test.setup(&mut registry, &mut ctx) {
            log::error!("{} setup failed: {e}", test.name());
            ctx.notify_complete(false);
        }
        let mut keys: Vec<&str> = registry.keys().collect();
        keys.sort_unstable();
        log::debug!("{} handles: {}", test.name(), keys.join(", "));
        self.flush(&mut ctx)?;

        let outcome = if ctx.verdict() == Some(false) {
            TestOutcome::Fail
        } else {
            self.dispatch(test, &registry, &mut ctx)?
        };

        if let Err(e) = test.teardown() {
            log::warn!("{} teardown failed: {e}", test.name());
        }

        match outcome {
            TestOutcome::Pass => log::info!("{}: pass", test.name()),
            other => {
                log::error!("{}: {other:?}", test.name());
                let transcript = self.transcript.lock();
                if !transcript.is_empty() {
                    log::debug!("KV transcript ({} messages):\n{}", transcript.len(), transcript.to_text(true));
                }
            }
        }
        Ok(outcome)
    }

    fn dispatch<T: HostTest>(&mut self, test: &mut T, registry: &Registry<T>, ctx: &mut HostContext) -> Result<TestOutcome> {
        let mut deadline = Instant::now() + self.timeout;
        let sync_id = sync_token();
        let mut synced = false;
        let mut next_sync = Instant::now();
        let mut dut_result: Option<bool> = None;

        loop {
            let now = Instant::now();
            if !synced && now >= next_sync {
                self.link.send(KvMessage::new("__sync", sync_id.as_str()))?;
                next_sync = now + self.sync_retry;
            }

            let mut wait = deadline.saturating_duration_since(now);
            if !synced {
                wait = wait.min(next_sync.saturating_duration_since(now));
            }
            let event = match self.link.events().recv_timeout(wait) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => return Ok(TestOutcome::Timeout),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let (msg, timestamp) = match event {
                LinkEvent::Kv(msg, timestamp) => (msg, timestamp),
                LinkEvent::Console(_) => continue,
                LinkEvent::Error(e) => {
                    log::error!("DUT link: {e}");
                    continue;
                }
                LinkEvent::Closed => break,
            };

            if !synced {
                if msg.key == "__sync" && msg.value == sync_id {
                    log::debug!("DUT synchronised ({sync_id})");
                    synced = true;
                } else {
                    log::debug!("dropping {msg} received before sync");
                }
                continue;
            }

            match msg.key.as_str() {
                "__sync" => log::debug!("ignoring repeated sync '{}'", msg.value),
                "__version" => log::info!("DUT greentea client {}", msg.value),
                "__timeout" => match msg.value.trim().parse::<u64>() {
                    Ok(secs) => {
                        log::debug!("DUT requested a {secs}s timeout");
                        deadline = Instant::now() + Duration::from_secs(secs);
                    }
                    Err(_) => log::warn!("ignoring bad timeout '{}'", msg.value),
                },
                "__host_test_name" => log::info!("DUT requested host test '{}'", msg.value),
                "end" => dut_result = Some(msg.value == "success"),
                "__exit" => break,
                key => match registry.get(key) {
                    Some(callback) => {
                        let event = KvEvent { key: msg.key.clone(), value: msg.value.clone(), timestamp };
                        if let Err(e) = callback(test, &event, ctx) {
                            log::error!("callback '{key}' failed: {e}");
                            ctx.notify_complete(false);
                        }
                    }
                    None => log::warn!("no callback registered for '{key}'"),
                },
            }

            self.flush(ctx)?;
            if ctx.verdict() == Some(false) {
                return Ok(TestOutcome::Fail);
            }
            if ctx.verdict() == Some(true) {
                return Ok(TestOutcome::Pass);
            }
        }

        Ok(match dut_result {
            Some(true) => TestOutcome::Pass,
            _ => TestOutcome::Fail,
        })
    }

    fn flush(&mut self, ctx: &mut HostContext) -> Result<()> {
        for msg in ctx.take_outbox() {
            self.link.send(msg)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLink;
    use super::*;
    use crate::error::Error;
    use crate::transcript::Transcript;

    #[derive(Default)]
    struct Echo {
        pings: usize,
        torn_down: bool,
        fail_setup: bool,
    }

    impl Echo {
        fn ping(&mut self, event: &KvEvent, ctx: &mut HostContext) -> Result<()> {
            self.pings += 1;
            ctx.send_kv("pong", &event.value);
            Ok(())
        }

        fn explode(&mut self, _: &KvEvent, _: &mut HostContext) -> Result<()> {
            Err(Error::HostTest("boom".into()))
        }
    }

    impl HostTest for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn setup(&mut self, registry: &mut Registry<Self>, ctx: &mut HostContext) -> Result<()> {
            registry.register_callback("ping", Self::ping);
            registry.register_callback("explode", Self::explode);
            if self.fail_setup {
                ctx.notify_complete(false);
            }
            Ok(())
        }

        fn teardown(&mut self) -> Result<()> {
            self.torn_down = true;
            Ok(())
        }
    }

    fn run_over(link: ScriptedLink, timeout: Duration, test: &mut Echo) -> (TestOutcome, Vec<KvMessage>) {
        let mut runner = HostTestRunner::new(link, timeout, Transcript::shared(64));
        runner.sync_retry = Duration::from_millis(50);
        let outcome = runner.run(test).unwrap();
        (outcome, runner.into_link().sent)
    }

    fn run(script: &[(&str, &str)], test: &mut Echo) -> (TestOutcome, Vec<KvMessage>) {
        let (link, _tx) = ScriptedLink::new(script);
        run_over(link, Duration::from_millis(200), test)
    }

    #[test]
    fn passes_when_dut_reports_success() {
        let mut test = Echo::default();
        let (outcome, sent) = run(
            &[("__version", "1.3.0"), ("__timeout", "20"), ("ping", "1"), ("ping", "2"), ("end", "success"), ("__exit", "0")],
            &mut test,
        );
        assert_eq!(outcome, TestOutcome::Pass);
        assert_eq!(test.pings, 2);
        assert!(test.torn_down);
        assert_eq!(sent[0].key, "__sync");
        assert_eq!(sent[1..], [KvMessage::new("pong", "1"), KvMessage::new("pong", "2")]);
    }

    #[test]
    fn sync_ids_differ_between_runs() {
        let (_, first) = run(&[("__exit", "0")], &mut Echo::default());
        std::thread::sleep(Duration::from_millis(1));
        let (_, second) = run(&[("__exit", "0")], &mut Echo::default());
        assert_eq!(first[0].key, "__sync");
        assert_eq!(first[0].value.len(), 36);
        assert_ne!(first[0].value, second[0].value);
    }

    #[test]
    fn sync_is_resent_until_echoed() {
        let (link, _tx) = ScriptedLink::unsynced(&[]);
        let (outcome, sent) = run_over(link, Duration::from_millis(300), &mut Echo::default());
        assert_eq!(outcome, TestOutcome::Timeout);
        assert!(sent.len() >= 3, "{sent:?}");
        assert!(sent.iter().all(|msg| msg.key == "__sync" && msg.value == sent[0].value));
    }

    #[test]
    fn mismatched_sync_echo_is_ignored() {
        let mut test = Echo::default();
        let (link, _tx) =
            ScriptedLink::unsynced(&[("__sync", "not-our-id"), ("ping", "1"), ("end", "success"), ("__exit", "0")]);
        let (outcome, sent) = run_over(link, Duration::from_millis(200), &mut test);
        assert_eq!(outcome, TestOutcome::Timeout);
        assert_eq!(test.pings, 0);
        assert!(sent.iter().all(|msg| msg.key == "__sync"));
    }

    #[test]
    fn dut_failure_fails() {
        let (outcome, _) = run(&[("end", "failure"), ("__exit", "1")], &mut Echo::default());
        assert_eq!(outcome, TestOutcome::Fail);
    }

    #[test]
    fn callback_error_fails_immediately() {
        let mut test = Echo::default();
        let (outcome, _) = run(&[("explode", ""), ("ping", "1"), ("end", "success")], &mut test);
        assert_eq!(outcome, TestOutcome::Fail);
        assert_eq!(test.pings, 0);
        assert!(test.torn_down);
    }

    #[test]
    fn failed_setup_skips_dispatch() {
        let mut test = Echo { fail_setup: true, ..Default::default() };
        let (outcome, sent) = run(&[("ping", "1")], &mut test);
        assert_eq!(outcome, TestOutcome::Fail);
        assert!(sent.is_empty());
        assert!(test.torn_down);
    }

    #[test]
    fn silent_dut_times_out() {
        let (outcome, _) = run(&[("ping", "1")], &mut Echo::default());
        assert_eq!(outcome, TestOutcome::Timeout);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let (outcome, sent) = run(&[("mystery", "x"), ("end", "success"), ("__exit", "0")], &mut Echo::default());
        assert_eq!(outcome, TestOutcome::Pass);
        assert_eq!(sent.len(), 1);
    }
}
