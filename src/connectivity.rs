//! Tri-state connectivity tracking with a debounced active probe.
//!
//! State starts `Unknown` and settles to `Online`/`Offline`; it never
//! returns to `Unknown`. Platform "went offline" signals apply
//! immediately; "went online" signals only take effect through a
//! confirming probe. A single failed probe while online is treated as
//! transient packet loss; the state flips only after a configured number
//! of consecutive failures.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
  Unknown,
  Online,
  Offline,
}

impl ConnState {
  fn from_u8(v: u8) -> Self {
    match v {
      1 => ConnState::Online,
      2 => ConnState::Offline,
      _ => ConnState::Unknown,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      ConnState::Unknown => 0,
      ConnState::Online => 1,
      ConnState::Offline => 2,
    }
  }
}

impl fmt::Display for ConnState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ConnState::Unknown => "unknown",
      ConnState::Online => "online",
      ConnState::Offline => "offline",
    };
    f.write_str(s)
  }
}

type Subscriber = Box<dyn Fn(ConnState) + Send + Sync>;

pub struct ConnectivityMonitor {
  state: AtomicU8,
  consecutive_failures: AtomicU32,
  subscribers: Mutex<Vec<Subscriber>>,
  http: reqwest::Client,
  ping_url: Url,
  probe_timeout: Duration,
  failure_threshold: u32,
}

impl ConnectivityMonitor {
  pub fn new(
    http: reqwest::Client,
    base: &Url,
    probe_timeout: Duration,
    failure_threshold: u32,
  ) -> color_eyre::Result<Self> {
    let ping_url = base
      .join("/ping")
      .map_err(|e| color_eyre::eyre::eyre!("Invalid server URL {}: {}", base, e))?;

    Ok(Self {
      state: AtomicU8::new(ConnState::Unknown.as_u8()),
      consecutive_failures: AtomicU32::new(0),
      subscribers: Mutex::new(Vec::new()),
      http,
      ping_url,
      probe_timeout,
      failure_threshold: failure_threshold.max(1),
    })
  }

  pub fn state(&self) -> ConnState {
    ConnState::from_u8(self.state.load(Ordering::SeqCst))
  }

  pub fn is_offline(&self) -> bool {
    self.state() == ConnState::Offline
  }

  /// Register a callback invoked synchronously on every state change.
  pub fn subscribe(&self, f: impl Fn(ConnState) + Send + Sync + 'static) {
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push(Box::new(f));
    }
  }

  /// Probe the liveness endpoint once and fold the outcome into the
  /// debounced state.
  pub async fn probe(&self) -> ConnState {
    let ok = match self
      .http
      .get(self.ping_url.clone())
      .timeout(self.probe_timeout)
      .send()
      .await
    {
      Ok(resp) => resp.status().is_success(),
      // Timeouts and transport failures count the same
      Err(_) => false,
    };
    self.record_probe(ok);
    self.state()
  }

  /// Fold one probe outcome into the state machine.
  pub fn record_probe(&self, ok: bool) {
    if ok {
      self.consecutive_failures.store(0, Ordering::SeqCst);
      self.transition(ConnState::Online);
      return;
    }

    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
    if self.state() == ConnState::Online && failures < self.failure_threshold {
      tracing::debug!(failures, "transient probe failure, staying online");
      return;
    }
    self.transition(ConnState::Offline);
  }

  /// Platform "went offline" signal: applied immediately, no probe. A
  /// "went online" signal has no immediate counterpart; it must confirm
  /// through [`probe`](Self::probe).
  #[allow(dead_code)]
  pub fn note_offline_signal(&self) {
    self.consecutive_failures.store(0, Ordering::SeqCst);
    self.transition(ConnState::Offline);
  }

  /// Passive confirmation from a successfully classified response,
  /// separate from the active probe.
  pub fn observe_success(&self) {
    self.consecutive_failures.store(0, Ordering::SeqCst);
    self.transition(ConnState::Online);
  }

  fn transition(&self, next: ConnState) {
    let prev = ConnState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst));
    if prev == next {
      return;
    }
    tracing::info!(from = %prev, to = %next, "connectivity changed");

    if let Ok(subscribers) = self.subscribers.lock() {
      for subscriber in subscribers.iter() {
        subscriber(next);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn monitor(threshold: u32) -> ConnectivityMonitor {
    let base = Url::parse("http://localhost:3000").unwrap();
    ConnectivityMonitor::new(
      reqwest::Client::new(),
      &base,
      Duration::from_secs(2),
      threshold,
    )
    .unwrap()
  }

  #[test]
  fn test_initial_state_is_unknown() {
    assert_eq!(monitor(2).state(), ConnState::Unknown);
  }

  #[test]
  fn test_first_failed_probe_from_unknown_goes_offline() {
    let m = monitor(2);
    m.record_probe(false);
    assert_eq!(m.state(), ConnState::Offline);
  }

  #[test]
  fn test_single_failure_does_not_flip_online() {
    let m = monitor(2);
    m.record_probe(true);
    assert_eq!(m.state(), ConnState::Online);

    m.record_probe(false);
    assert_eq!(m.state(), ConnState::Online);

    m.record_probe(false);
    assert_eq!(m.state(), ConnState::Offline);
  }

  #[test]
  fn test_success_resets_failure_count() {
    let m = monitor(2);
    m.record_probe(true);
    m.record_probe(false);
    m.record_probe(true);
    m.record_probe(false);
    // One failure after each success: still online
    assert_eq!(m.state(), ConnState::Online);
  }

  #[test]
  fn test_offline_signal_applies_immediately() {
    let m = monitor(5);
    m.record_probe(true);
    m.note_offline_signal();
    assert_eq!(m.state(), ConnState::Offline);
  }

  #[test]
  fn test_passive_observation_confirms_online() {
    let m = monitor(2);
    m.record_probe(false);
    assert_eq!(m.state(), ConnState::Offline);
    m.observe_success();
    assert_eq!(m.state(), ConnState::Online);
  }

  #[test]
  fn test_subscribers_see_transitions_not_repeats() {
    let m = monitor(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    m.subscribe(move |state| seen_clone.lock().unwrap().push(state));

    m.record_probe(true);
    m.record_probe(true); // no transition
    m.note_offline_signal();
    m.observe_success();

    let seen = seen.lock().unwrap();
    assert_eq!(
      *seen,
      vec![ConnState::Online, ConnState::Offline, ConnState::Online]
    );
  }
}
