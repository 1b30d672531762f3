use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::address::read_address;
use crate::model::Password;
use crate::session::{build_request, decode_record, EepromSession};
use crate::snmp::{SnmpClient, SnmpResponse};
use crate::targets;

pub const PASSWORD_SPACE: u32 = 1 << 16;

const NOT_FOUND: u32 = u32::MAX;
const PROGRESS_EVERY: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BruteForceConfig {
    pub workers: usize,
    /// Per-candidate timeout; falls back to the session timeout when unset.
    pub timeout_ms: Option<u64>,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            timeout_ms: Some(500),
        }
    }
}

/// What counts as an accepted password.
#[derive(Debug, Clone, Default)]
pub enum ExpectedPattern {
    /// A well-formed `EE:` record echoing the probed address.
    #[default]
    EepromEcho,
    /// Response text matching an arbitrary expression.
    Regex(Regex),
}

impl ExpectedPattern {
    pub fn matches(&self, response: &SnmpResponse, test_oid: u8) -> bool {
        match self {
            ExpectedPattern::EepromEcho => {
                decode_record(response, &response.address, test_oid).is_ok()
            }
            ExpectedPattern::Regex(regex) => response
                .varbinds
                .first()
                .and_then(|varbind| varbind.value.as_text_lossy())
                .is_some_and(|text| regex.is_match(&text)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BruteForceOutcome {
    Found { password: Password, attempts: u64 },
    NotFound { attempts: u64 },
    Cancelled { attempts: u64 },
}

impl BruteForceOutcome {
    pub fn attempts(&self) -> u64 {
        match self {
            BruteForceOutcome::Found { attempts, .. }
            | BruteForceOutcome::NotFound { attempts }
            | BruteForceOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn password(&self) -> Option<Password> {
        match self {
            BruteForceOutcome::Found { password, .. } => Some(*password),
            _ => None,
        }
    }
}

impl<C: SnmpClient + 'static> EepromSession<C> {
    /// Probes every password from `0.0` to `255.255` against `test_oid`,
    /// dispatching candidates in ascending order to a bounded worker pool.
    ///
    /// Each candidate gets exactly one attempt. Workers stop taking new
    /// candidates once a hit is recorded or `cancel` fires; requests already
    /// in flight are allowed to finish. When several candidates match, the
    /// lowest is credited. On success the session adopts the password.
    pub async fn brute_force(
        &mut self,
        test_oid: u8,
        pattern: &ExpectedPattern,
        config: &BruteForceConfig,
        cancel: &CancellationToken,
    ) -> BruteForceOutcome {
        let workers = config.workers.max(1);
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.timeout);
        let next = Arc::new(AtomicU32::new(0));
        let attempts = Arc::new(AtomicU64::new(0));
        let found = Arc::new(AtomicU32::new(NOT_FOUND));
        let stop = cancel.child_token();
        let pattern = Arc::new(pattern.clone());

        info!(
            target: targets::BRUTE_FORCE,
            address = %self.address,
            test_oid,
            workers,
            "Password search started"
        );

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let client = Arc::clone(&self.client);
            let address = self.address.clone();
            let community = self.community.clone();
            let link = self.link.clone();
            let next = Arc::clone(&next);
            let attempts = Arc::clone(&attempts);
            let found = Arc::clone(&found);
            let stop = stop.clone();
            let pattern = Arc::clone(&pattern);

            pool.spawn(async move {
                while !stop.is_cancelled() {
                    let candidate = next.fetch_add(1, Ordering::SeqCst);
                    if candidate >= PASSWORD_SPACE {
                        break;
                    }
                    let password = Password::from_u16(candidate as u16);
                    let issued = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if issued % PROGRESS_EVERY == 0 {
                        debug!(
                            target: targets::BRUTE_FORCE,
                            address = %address,
                            attempts = issued,
                            candidate = %password,
                            "Password search progress"
                        );
                    }

                    let request = build_request(
                        &address,
                        community.as_deref(),
                        timeout,
                        read_address(&link, password, test_oid),
                    );
                    match client.get(request).await {
                        Ok(response) if pattern.matches(&response, test_oid) => {
                            found.fetch_min(candidate, Ordering::SeqCst);
                            stop.cancel();
                            break;
                        }
                        Ok(_) => {
                            trace!(target: targets::BRUTE_FORCE, worker, candidate = %password, "Rejected");
                        }
                        Err(error) => {
                            trace!(
                                target: targets::BRUTE_FORCE,
                                worker,
                                candidate = %password,
                                error = %error,
                                "Candidate exchange failed"
                            );
                        }
                    }
                }
            });
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(error) = joined {
                warn!(target: targets::BRUTE_FORCE, error = %error, "Password worker aborted");
            }
        }

        let attempts = attempts.load(Ordering::SeqCst);
        self.requests += attempts;

        let found = found.load(Ordering::SeqCst);
        if found != NOT_FOUND {
            let password = Password::from_u16(found as u16);
            self.password = password;
            info!(
                target: targets::BRUTE_FORCE,
                address = %self.address,
                password = %password,
                attempts,
                "Password found"
            );
            return BruteForceOutcome::Found { password, attempts };
        }

        if cancel.is_cancelled() {
            info!(target: targets::BRUTE_FORCE, address = %self.address, attempts, "Password search cancelled");
            return BruteForceOutcome::Cancelled { attempts };
        }

        info!(target: targets::BRUTE_FORCE, address = %self.address, attempts, "Password not found");
        BruteForceOutcome::NotFound { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use crate::session::RetryPolicy;
    use crate::simulator::EepromSimulator;
    use crate::model::ModelEntry;
    use crate::snmp::{SnmpAddress, SnmpValue};

    fn run_future<T>(future: impl std::future::Future<Output = T>) -> T {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        runtime.block_on(future)
    }

    fn model() -> ModelEntry {
        ModelRegistry::builtin()
            .expect("builtin")
            .lookup("EPSON WF-7525 Series")
            .expect("model")
            .clone()
    }

    fn session(simulator: Arc<EepromSimulator>) -> EepromSession<EepromSimulator> {
        let model = model();
        EepromSession::new(simulator, SnmpAddress::with_default_port("10.0.0.9"), &model)
            .with_password(Password::new(0, 0))
            .with_retry(RetryPolicy::single())
    }

    fn config(workers: usize) -> BruteForceConfig {
        BruteForceConfig {
            workers,
            timeout_ms: None,
        }
    }

    #[test]
    fn finds_password_sequentially() {
        let simulator = Arc::new(
            EepromSimulator::new(&model())
                .with_password(Some(Password::new(40, 0)))
                .with_register(0, 0x11),
        );
        let mut session = session(simulator.clone());
        let cancel = CancellationToken::new();
        let outcome = run_future(session.brute_force(
            0,
            &ExpectedPattern::EepromEcho,
            &config(1),
            &cancel,
        ));

        assert_eq!(outcome.password(), Some(Password::new(40, 0)));
        assert_eq!(outcome.attempts(), 0x2800 + 1);
        assert_eq!(simulator.attempts(), 0x2800 + 1);
        assert_eq!(session.password(), Password::new(40, 0));
        assert_eq!(run_future(session.read(0)).expect("read"), 0x11);
    }

    #[test]
    fn finds_password_with_worker_pool() {
        let simulator =
            Arc::new(EepromSimulator::new(&model()).with_password(Some(Password::new(40, 0))));
        let mut session = session(simulator.clone());
        let cancel = CancellationToken::new();
        let outcome = run_future(session.brute_force(
            0,
            &ExpectedPattern::EepromEcho,
            &config(16),
            &cancel,
        ));

        match outcome {
            BruteForceOutcome::Found { password, attempts } => {
                assert_eq!(password, Password::new(40, 0));
                assert!(attempts >= 1);
                assert!(attempts <= u64::from(PASSWORD_SPACE));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn exhausts_space_when_nothing_matches() {
        let simulator = Arc::new(EepromSimulator::new(&model()).with_password(None));
        let mut session = session(simulator.clone());
        let cancel = CancellationToken::new();
        let outcome = run_future(session.brute_force(
            0,
            &ExpectedPattern::EepromEcho,
            &config(8),
            &cancel,
        ));

        assert_eq!(outcome, BruteForceOutcome::NotFound { attempts: 65_536 });
        assert_eq!(simulator.attempts(), 65_536);
        assert_eq!(session.requests(), 65_536);
    }

    #[test]
    fn timeouts_advance_to_next_candidate() {
        let simulator = Arc::new(
            EepromSimulator::new(&model())
                .with_password(Some(Password::new(0, 3)))
                .with_transient_failures(0, 2),
        );
        let mut session = session(simulator.clone());
        let cancel = CancellationToken::new();
        let outcome = run_future(session.brute_force(
            0,
            &ExpectedPattern::EepromEcho,
            &config(1),
            &cancel,
        ));
        assert_eq!(
            outcome,
            BruteForceOutcome::Found {
                password: Password::new(0, 3),
                attempts: 4,
            }
        );
    }

    #[test]
    fn cancelled_search_issues_nothing() {
        let simulator = Arc::new(EepromSimulator::new(&model()).with_password(None));
        let mut session = session(simulator.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_future(session.brute_force(
            0,
            &ExpectedPattern::EepromEcho,
            &config(4),
            &cancel,
        ));
        assert_eq!(outcome, BruteForceOutcome::Cancelled { attempts: 0 });
        assert_eq!(simulator.attempts(), 0);
    }

    #[test]
    fn regex_pattern_is_configurable() {
        let response = SnmpResponse::single(
            SnmpAddress::with_default_port("10.0.0.9"),
            "1.3.6".parse().expect("oid"),
            SnmpValue::text("@BDC PS\r\nOK;"),
        );
        let pattern = ExpectedPattern::Regex(Regex::new(r"OK;").expect("regex"));
        assert!(pattern.matches(&response, 0));
        assert!(!ExpectedPattern::EepromEcho.matches(&response, 0));
    }
}
