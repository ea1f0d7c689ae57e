//! Retrying connection
//!
//! Runs one logical request as a bounded sequence of physical attempts over a
//! [`Port`]. Each failed attempt is classified through [`ProtocolError::recovery`]:
//! response decoding faults ask the slave to resend its last response right away,
//! everything else waits the resend delay and issues the original command again.

use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument, Span};

use super::{HexBytes, Port, ProtocolError, Recovery, RequestFrame, ResponseFrame};
use crate::config::RetryPolicy;

/// Which request the next physical attempt sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptMode {
    /// The caller's request
    Original,
    /// The reserved resend command for the caller's slave address
    Resend,
}

/// State of one logical request between physical attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Request sent by this attempt
    pub mode: AttemptMode,
    /// Errors still tolerated, this attempt included
    pub remaining: u32,
}

/// What follows a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run `attempt`, after sleeping `delay` if set
    Retry {
        /// Next attempt
        attempt: Attempt,
        /// Pause before it
        delay: Option<Duration>,
    },
    /// Propagate the error
    GiveUp,
}

impl Attempt {
    /// First attempt of a request with an error budget of `max_errors`
    pub fn initial(max_errors: u32) -> Self {
        Self {
            mode: AttemptMode::Original,
            remaining: max_errors,
        }
    }

    /// Transition after this attempt failed with `error`
    pub fn next(self, error: &ProtocolError, resend_delay: Duration) -> Step {
        let remaining = self.remaining.saturating_sub(1);
        if remaining < 1 {
            return Step::GiveUp;
        }

        match error.recovery() {
            Some(Recovery::RequestResend) => Step::Retry {
                attempt: Attempt {
                    mode: AttemptMode::Resend,
                    remaining,
                },
                delay: None,
            },
            Some(Recovery::ResendOriginal) => Step::Retry {
                attempt: Attempt {
                    mode: AttemptMode::Original,
                    remaining,
                },
                delay: Some(resend_delay),
            },
            None => Step::GiveUp,
        }
    }
}

/// Check that `response` answers `request` and reports success
pub fn validate_response(
    request: &RequestFrame,
    response: &ResponseFrame,
) -> Result<(), ProtocolError> {
    if response.slave_address != request.slave_address {
        return Err(ProtocolError::SlaveAddressMismatch {
            expected: request.slave_address,
            actual: response.slave_address,
        });
    }
    if response.command_id != request.command_id {
        return Err(ProtocolError::CommandIdMismatch {
            expected: request.command_id,
            actual: response.command_id,
        });
    }
    if !response.slave_state.is_ok() {
        return Err(ProtocolError::SlaveState(response.slave_state));
    }
    Ok(())
}

/// Request/response exchange with error recovery on top of a [`Port`]
pub struct RetryConnection<P: Port> {
    port: P,
    policy: RetryPolicy,
    span: Span,
}

impl<P: Port> RetryConnection<P> {
    /// Wrap `port`
    pub fn new(port: P, policy: RetryPolicy) -> Self {
        Self::with_span(port, policy, info_span!("connection"))
    }

    /// Wrap `port`, logging into `span`
    pub fn with_span(port: P, policy: RetryPolicy, span: Span) -> Self {
        Self { port, policy, span }
    }

    /// The underlying port
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Retry settings in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open the underlying port
    pub async fn open(&self) -> Result<(), ProtocolError> {
        self.port.open().await
    }

    /// Close the underlying port
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.port.close().await
    }

    /// Send `request` and return the validated response.
    ///
    /// `response_timeout` is the slave's declared maximum response time for the command.
    /// Once the error budget is spent the last error is returned unchanged.
    pub async fn transceive(
        &self,
        request: &RequestFrame,
        response_timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError> {
        self.run(request, response_timeout)
            .instrument(self.span.clone())
            .await
    }

    async fn run(
        &self,
        request: &RequestFrame,
        response_timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError> {
        let original = request.to_bytes()?;
        let resend = RequestFrame::resend(request.slave_address).to_bytes()?;
        let mut attempt = Attempt::initial(self.policy.max_errors);

        loop {
            let payload = match attempt.mode {
                AttemptMode::Original => &original,
                AttemptMode::Resend => &resend,
            };
            debug!(
                mode = ?attempt.mode,
                remaining = attempt.remaining,
                request = %HexBytes(payload),
                "attempt"
            );

            let error = match self.attempt(request, payload, response_timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            match attempt.next(&error, self.policy.resend_delay()) {
                Step::GiveUp => {
                    warn!(error = %error, "giving up");
                    return Err(error);
                }
                Step::Retry {
                    attempt: next,
                    delay,
                } => {
                    warn!(error = %error, next = ?next.mode, "attempt failed, retrying");
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = next;
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &RequestFrame,
        payload: &[u8],
        response_timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError> {
        let received = self.port.transceive(payload, response_timeout).await?;
        let response = ResponseFrame::from_bytes(&received)?;
        validate_response(request, &response)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SlaveState, RESEND_COMMAND_ID};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Port that answers from a script and records what it was asked
    struct ScriptedPort {
        replies: Mutex<VecDeque<Result<Vec<u8>, ProtocolError>>>,
        calls: Mutex<Vec<(Instant, Vec<u8>)>>,
    }

    impl ScriptedPort {
        fn new(replies: Vec<Result<Vec<u8>, ProtocolError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn payloads(&self) -> Vec<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn gap(&self, index: usize) -> Duration {
            let calls = self.calls.lock().unwrap();
            calls[index].0 - calls[index - 1].0
        }
    }

    #[async_trait]
    impl Port for ScriptedPort {
        async fn open(&self) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn transceive(
            &self,
            payload: &[u8],
            _response_timeout: Duration,
        ) -> Result<Vec<u8>, ProtocolError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), payload.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProtocolError::StreamClosed))
        }
    }

    fn request() -> RequestFrame {
        RequestFrame::new(0x00, 0x35, Vec::new())
    }

    fn reply(address: u8, command: u8, state: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        ResponseFrame {
            slave_address: address,
            command_id: command,
            slave_state: SlaveState(state),
            command_data: data.to_vec(),
        }
        .to_bytes()
    }

    fn timeout() -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::NoResponseTimeout {
            waited: Duration::from_millis(200),
            received: 0,
        })
    }

    fn connection(replies: Vec<Result<Vec<u8>, ProtocolError>>) -> RetryConnection<ScriptedPort> {
        RetryConnection::new(ScriptedPort::new(replies), RetryPolicy::default())
    }

    const WAIT: Duration = Duration::from_millis(1);

    #[test]
    fn test_checksum_error_switches_to_resend_without_delay() {
        let error = ProtocolError::ChecksumInvalid {
            expected: 0x03,
            actual: Some(0x04),
        };
        let step = Attempt::initial(3).next(&error, Duration::from_millis(100));
        assert_eq!(
            step,
            Step::Retry {
                attempt: Attempt {
                    mode: AttemptMode::Resend,
                    remaining: 2
                },
                delay: None
            }
        );
    }

    #[test]
    fn test_timeout_after_resend_returns_to_original_with_delay() {
        let attempt = Attempt {
            mode: AttemptMode::Resend,
            remaining: 2,
        };
        let error = ProtocolError::PortBusy;
        assert_eq!(
            attempt.next(&error, Duration::from_millis(100)),
            Step::Retry {
                attempt: Attempt {
                    mode: AttemptMode::Original,
                    remaining: 1
                },
                delay: Some(Duration::from_millis(100))
            }
        );
    }

    #[test]
    fn test_last_unit_of_budget_gives_up() {
        let attempt = Attempt {
            mode: AttemptMode::Original,
            remaining: 1,
        };
        assert_eq!(attempt.next(&ProtocolError::PortBusy, WAIT), Step::GiveUp);
        assert_eq!(
            Attempt::initial(0).next(&ProtocolError::PortBusy, WAIT),
            Step::GiveUp
        );
    }

    #[test]
    fn test_unclassified_error_gives_up() {
        assert_eq!(
            Attempt::initial(3).next(&ProtocolError::NotOpen, WAIT),
            Step::GiveUp
        );
    }

    #[test]
    fn test_validation_order() {
        let request = request();
        let mut response = ResponseFrame {
            slave_address: 0x01,
            command_id: 0x36,
            slave_state: SlaveState(0x20),
            command_data: Vec::new(),
        };
        assert!(matches!(
            validate_response(&request, &response),
            Err(ProtocolError::SlaveAddressMismatch {
                expected: 0x00,
                actual: 0x01
            })
        ));

        response.slave_address = 0x00;
        assert!(matches!(
            validate_response(&request, &response),
            Err(ProtocolError::CommandIdMismatch {
                expected: 0x35,
                actual: 0x36
            })
        ));

        response.command_id = 0x35;
        assert!(matches!(
            validate_response(&request, &response),
            Err(ProtocolError::SlaveState(SlaveState(0x20)))
        ));

        response.slave_state = SlaveState(0x00);
        assert!(validate_response(&request, &response).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let connection = connection(vec![reply(0x00, 0x35, 0x00, &[0xFF, 0xC6])]);

        let response = connection.transceive(&request(), WAIT).await.expect("response");
        assert_eq!(response.command_data, vec![0xFF, 0xC6]);
        assert_eq!(connection.port().payloads(), vec![vec![0x00, 0x35, 0x00]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_never_reaches_port() {
        let connection = connection(vec![reply(0x00, 0x35, 0x00, &[])]);
        let oversized = RequestFrame::new(0x00, 0x35, vec![0x00; 300]);

        let err = connection.transceive(&oversized, WAIT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DataTooLong { len: 300, max: 255 }));
        assert!(connection.port().payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checksum_error_requests_resend_immediately() {
        let connection = connection(vec![
            Err(ProtocolError::ChecksumInvalid {
                expected: 0x03,
                actual: Some(0x04),
            }),
            reply(0x00, 0x35, 0x00, &[0x01]),
        ]);

        // The resent answer is validated against the caller's request
        let response = connection.transceive(&request(), WAIT).await.expect("response");
        assert_eq!(response.command_data, vec![0x01]);

        let payloads = connection.port().payloads();
        assert_eq!(payloads[0], vec![0x00, 0x35, 0x00]);
        assert_eq!(payloads[1], vec![0x00, RESEND_COMMAND_ID, 0x00]);
        assert_eq!(connection.port().gap(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_error_requests_resend() {
        let connection = connection(vec![
            Ok(vec![0x00, 0x35, 0x00, 0x03, 0x01]),
            reply(0x00, 0x35, 0x00, &[0x01, 0x02, 0x03]),
        ]);

        connection.transceive(&request(), WAIT).await.expect("response");
        let payloads = connection.port().payloads();
        assert_eq!(payloads[1][1], RESEND_COMMAND_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_busy_resends_original_after_delay() {
        let connection = connection(vec![
            Err(ProtocolError::PortBusy),
            reply(0x00, 0x35, 0x00, &[]),
        ]);

        connection.transceive(&request(), WAIT).await.expect("response");
        let payloads = connection.port().payloads();
        assert_eq!(payloads, vec![vec![0x00, 0x35, 0x00], vec![0x00, 0x35, 0x00]]);
        assert_eq!(connection.port().gap(1), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let connection = connection(vec![
            Err(ProtocolError::PortBusy),
            timeout(),
            reply(0x00, 0x35, 0x00, &[0x2A]),
        ]);

        let response = connection.transceive(&request(), WAIT).await.expect("response");
        assert_eq!(response.command_data, vec![0x2A]);
        assert_eq!(connection.port().payloads().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slave_state_error_is_retried() {
        let connection = connection(vec![
            reply(0x00, 0x35, 0x20, &[]),
            reply(0x00, 0x35, 0x00, &[0x07]),
        ]);

        let response = connection.transceive(&request(), WAIT).await.expect("response");
        assert_eq!(response.command_data, vec![0x07]);
        assert_eq!(connection.port().payloads()[1], vec![0x00, 0x35, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_mismatch_is_reported() {
        let connection = connection(vec![
            reply(0x01, 0x35, 0x00, &[]),
            reply(0x01, 0x35, 0x00, &[]),
            reply(0x01, 0x35, 0x00, &[]),
        ]);

        let err = connection.transceive(&request(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SlaveAddressMismatch {
                expected: 0x00,
                actual: 0x01
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_makes_exactly_n_attempts() {
        let connection = connection(vec![timeout(), timeout(), timeout(), timeout()]);
        let start = Instant::now();

        let err = connection.transceive(&request(), WAIT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoResponseTimeout { .. }));
        assert_eq!(connection.port().payloads().len(), 3);
        // Two delays between three attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_is_propagated() {
        let connection = connection(vec![
            timeout(),
            Err(ProtocolError::PortBusy),
            reply(0x00, 0x35, 0x21, &[]),
        ]);

        let err = connection.transceive(&request(), WAIT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::SlaveState(SlaveState(0x21))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_propagates_immediately() {
        let connection = connection(vec![Err(ProtocolError::NotOpen), reply(0x00, 0x35, 0x00, &[])]);

        let err = connection.transceive(&request(), WAIT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotOpen));
        assert_eq!(connection.port().payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_per_request() {
        let connection = connection(vec![
            timeout(),
            timeout(),
            reply(0x00, 0x35, 0x00, &[]),
            timeout(),
            timeout(),
            reply(0x00, 0x35, 0x00, &[]),
        ]);

        connection.transceive(&request(), WAIT).await.expect("first");
        connection.transceive(&request(), WAIT).await.expect("second");
        assert_eq!(connection.port().payloads().len(), 6);
    }
}
