use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{Span, debug, info, instrument, warn};

use super::frame_io::{bounded, duration_ms, write_pair};
use super::{CorrelationId, FrameCodec};
use crate::error::InteractionError;
use crate::hw::{DeviceAddress, DeviceSession};
use crate::notification::{NotificationDispatcher, NotifyEvent};
use crate::protocol::EndpointId;
use crate::token_store::{AuthToken, TokenStore};

/// Progress of one token handshake.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    #[default]
    Idle,
    AwaitingAddressAck,
    AwaitingToken,
    Complete,
    Failed,
}

/// Errors returned by the token handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no token was obtained within {timeout_ms}ms (stopped in state `{state}`)")]
    Timeout {
        state: HandshakeState,
        timeout_ms: u64,
    },
    #[error("the notification stream closed in state `{state}`")]
    StreamClosed { state: HandshakeState },
    #[error("the {step} step failed")]
    Transport {
        step: &'static str,
        #[source]
        source: InteractionError,
    },
    #[error("gave up after {count} unrecognized notifications")]
    TooManyUnrecognized { count: usize },
    #[error("a handshake cannot start from state `{state}`")]
    InvalidStart { state: HandshakeState },
}

impl HandshakeError {
    /// Returns whether the failure came from the link rather than the device's replies.
    #[must_use]
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::StreamClosed { .. })
    }
}

/// Effect requested by a handshake transition.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Transition {
    /// The address was acknowledged; request a token next.
    RequestToken,
    /// A token was issued and the handshake is complete.
    Completed(AuthToken),
    /// The event does not advance the handshake from the current state.
    Ignored,
}

/// Pure transition table for the token handshake.
///
/// The reactive path only completes after an address acknowledgement followed
/// by a token acknowledgement. Events arriving out of order are ignored.
///
/// ```
/// use microbot::{HandshakeMachine, HandshakeState, NotifyEvent, Transition};
///
/// let mut machine = HandshakeMachine::new();
/// machine.start_fresh_pair()?;
/// let ack = NotifyEvent::AddressAck { address: "aabbccddeeff".into() };
/// assert_eq!(Transition::RequestToken, machine.on_event(&ack));
/// assert_eq!(HandshakeState::AwaitingToken, machine.state());
/// # Ok::<(), microbot::HandshakeError>(())
/// ```
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct HandshakeMachine {
    state: HandshakeState,
}

impl HandshakeMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Moves `Idle` to `AwaitingAddressAck`.
    ///
    /// # Errors
    ///
    /// Returns an error when the machine is not idle.
    pub fn start_fresh_pair(&mut self) -> Result<(), HandshakeError> {
        self.require_idle()?;
        self.state = HandshakeState::AwaitingAddressAck;
        Ok(())
    }

    /// Moves `Idle` straight to `Complete` for stored-token authentication.
    ///
    /// # Errors
    ///
    /// Returns an error when the machine is not idle.
    pub fn authenticate_with_stored(&mut self) -> Result<(), HandshakeError> {
        self.require_idle()?;
        self.state = HandshakeState::Complete;
        Ok(())
    }

    /// Feeds one decoded notification into the machine.
    pub fn on_event(&mut self, event: &NotifyEvent) -> Transition {
        match (self.state, event) {
            (HandshakeState::AwaitingAddressAck, NotifyEvent::AddressAck { .. }) => {
                self.state = HandshakeState::AwaitingToken;
                Transition::RequestToken
            }
            (HandshakeState::AwaitingToken, NotifyEvent::TokenAck { token }) => {
                self.state = HandshakeState::Complete;
                Transition::Completed(*token)
            }
            _ => Transition::Ignored,
        }
    }

    /// Marks the handshake as failed.
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }

    fn require_idle(&self) -> Result<(), HandshakeError> {
        if self.state == HandshakeState::Idle {
            Ok(())
        } else {
            Err(HandshakeError::InvalidStart { state: self.state })
        }
    }
}

/// Result of a successful fresh-pair handshake.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct PairOutcome {
    /// Whether the notification subscription could not be torn down.
    pub(crate) still_subscribed: bool,
}

/// Timing and tolerance knobs for the reactive handshake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandshakeOptions {
    pub(crate) handshake_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) unrecognized_limit: Option<usize>,
}

/// Drives the handshake over a live link.
pub struct HandshakeHandler;

impl HandshakeHandler {
    /// Runs the fresh-pair flow and persists the issued token.
    ///
    /// Subscribes before the init write so the acknowledgement cannot be
    /// missed, and unsubscribes as soon as the token arrives. Subscription
    /// and the notification exchange share `handshake_timeout`. A token that
    /// cannot be persisted is still returned.
    #[instrument(
        skip(session, machine, codec, store, options),
        level = "info",
        fields(%address, variant = %codec.variant(), final_state = tracing::field::Empty)
    )]
    pub(crate) async fn pair(
        session: &DeviceSession,
        machine: &mut HandshakeMachine,
        codec: FrameCodec,
        store: &TokenStore,
        address: &DeviceAddress,
        options: HandshakeOptions,
    ) -> Result<PairOutcome, HandshakeError> {
        let result = Self::pair_inner(session, machine, codec, store, address, options).await;
        if result.is_err() {
            machine.fail();
        }
        Span::current().record("final_state", tracing::field::display(machine.state()));
        result
    }

    async fn pair_inner(
        session: &DeviceSession,
        machine: &mut HandshakeMachine,
        codec: FrameCodec,
        store: &TokenStore,
        address: &DeviceAddress,
        options: HandshakeOptions,
    ) -> Result<PairOutcome, HandshakeError> {
        machine.start_fresh_pair()?;

        let exchange = Self::exchange(session, machine, codec, options);
        let token = match timeout(options.handshake_timeout, exchange).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(HandshakeError::Timeout {
                    state: machine.state(),
                    timeout_ms: duration_ms(options.handshake_timeout),
                });
            }
        };

        let unsubscribe = bounded(
            "unsubscribe",
            options.write_timeout,
            session.unsubscribe_endpoint(EndpointId::NotifyCharacteristic),
        );
        let still_subscribed = match unsubscribe.await {
            Ok(()) => false,
            Err(error) => {
                debug!(?error, "failed to unsubscribe after token issue");
                true
            }
        };

        if let Err(error) = store.save(address, &token) {
            warn!(?error, "token obtained but could not be persisted");
        }
        info!("device issued a new token");
        Ok(PairOutcome { still_subscribed })
    }

    /// Subscribes, sends init, and reacts to notifications until a token
    /// arrives. The caller bounds the whole exchange.
    async fn exchange(
        session: &DeviceSession,
        machine: &mut HandshakeMachine,
        codec: FrameCodec,
        options: HandshakeOptions,
    ) -> Result<AuthToken, HandshakeError> {
        let subscribe_failed = |source| HandshakeError::Transport {
            step: "subscribe",
            source,
        };
        session
            .subscribe_endpoint(EndpointId::NotifyCharacteristic)
            .await
            .map_err(subscribe_failed)?;
        let stream = session
            .notifications(EndpointId::NotifyCharacteristic)
            .await
            .map_err(subscribe_failed)?;
        let mut dispatcher = NotificationDispatcher::new(codec.variant(), stream);

        let init = codec.encode_init(CorrelationId::random());
        write_pair(session, &init, options.write_timeout)
            .await
            .map_err(|source| HandshakeError::Transport {
                step: "init",
                source,
            })?;

        let mut unrecognized = 0usize;
        loop {
            let Some(event) = dispatcher.next_event().await else {
                return Err(HandshakeError::StreamClosed {
                    state: machine.state(),
                });
            };

            match machine.on_event(&event) {
                Transition::RequestToken => {
                    let request = codec.encode_get_token(CorrelationId::random());
                    write_pair(session, &request, options.write_timeout)
                        .await
                        .map_err(|source| HandshakeError::Transport {
                            step: "get-token",
                            source,
                        })?;
                }
                Transition::Completed(token) => return Ok(token),
                Transition::Ignored => {
                    if matches!(event, NotifyEvent::Unrecognized(_)) {
                        unrecognized += 1;
                        if options
                            .unrecognized_limit
                            .is_some_and(|limit| unrecognized >= limit)
                        {
                            return Err(HandshakeError::TooManyUnrecognized {
                                count: unrecognized,
                            });
                        }
                    } else {
                        dispatcher.discard(&event);
                    }
                }
            }
        }
    }

    /// Authenticates with a stored token.
    ///
    /// This is a single unacknowledged write; no subscription is created.
    #[instrument(skip(session, machine, codec, token), level = "info", fields(variant = %codec.variant()))]
    pub(crate) async fn authenticate(
        session: &DeviceSession,
        machine: &mut HandshakeMachine,
        codec: FrameCodec,
        token: &AuthToken,
        write_timeout: Duration,
    ) -> Result<(), HandshakeError> {
        let frame = codec.encode_set_token(CorrelationId::random(), token);
        if let Err(source) = write_pair(session, &frame, write_timeout).await {
            machine.fail();
            return Err(HandshakeError::Transport {
                step: "set-token",
                source,
            });
        }
        machine.authenticate_with_stored()?;
        debug!("authenticated with stored token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn address_ack() -> NotifyEvent {
        NotifyEvent::AddressAck {
            address: "aabbccddeeff".to_string(),
        }
    }

    fn token_ack() -> NotifyEvent {
        NotifyEvent::TokenAck {
            token: "ab12ab12ab12ab12ab12ab1200000000"
                .parse()
                .expect("token should parse"),
        }
    }

    #[test]
    fn reactive_path_completes_after_address_then_token() {
        let mut machine = HandshakeMachine::new();
        machine
            .start_fresh_pair()
            .expect("idle machine should start");

        assert_eq!(Transition::RequestToken, machine.on_event(&address_ack()));
        assert_matches!(machine.on_event(&token_ack()), Transition::Completed(_));
        assert_eq!(HandshakeState::Complete, machine.state());
    }

    #[test]
    fn token_before_address_does_not_complete() {
        let mut machine = HandshakeMachine::new();
        machine
            .start_fresh_pair()
            .expect("idle machine should start");

        assert_eq!(Transition::Ignored, machine.on_event(&token_ack()));
        assert_eq!(HandshakeState::AwaitingAddressAck, machine.state());

        assert_eq!(Transition::RequestToken, machine.on_event(&address_ack()));
        assert_matches!(machine.on_event(&token_ack()), Transition::Completed(_));
    }

    #[rstest]
    #[case(HandshakeState::Idle)]
    #[case(HandshakeState::Complete)]
    #[case(HandshakeState::Failed)]
    fn events_are_ignored_outside_reactive_states(#[case] state: HandshakeState) {
        let mut machine = HandshakeMachine { state };
        assert_eq!(Transition::Ignored, machine.on_event(&address_ack()));
        assert_eq!(Transition::Ignored, machine.on_event(&token_ack()));
        assert_eq!(state, machine.state());
    }

    #[test]
    fn duplicate_address_ack_is_ignored() {
        let mut machine = HandshakeMachine::new();
        machine
            .start_fresh_pair()
            .expect("idle machine should start");
        machine.on_event(&address_ack());

        assert_eq!(Transition::Ignored, machine.on_event(&address_ack()));
        assert_eq!(HandshakeState::AwaitingToken, machine.state());
    }

    #[test]
    fn stored_token_path_skips_intermediate_states() {
        let mut machine = HandshakeMachine::new();
        machine
            .authenticate_with_stored()
            .expect("idle machine should authenticate");
        assert_eq!(HandshakeState::Complete, machine.state());
    }

    #[test]
    fn start_requires_idle_state() {
        let mut machine = HandshakeMachine::new();
        machine.fail();
        assert_matches!(
            machine.start_fresh_pair(),
            Err(HandshakeError::InvalidStart {
                state: HandshakeState::Failed
            })
        );
    }

    #[rstest]
    #[case(HandshakeError::StreamClosed { state: HandshakeState::AwaitingToken }, true)]
    #[case(HandshakeError::Timeout { state: HandshakeState::AwaitingToken, timeout_ms: 1 }, false)]
    #[case(HandshakeError::TooManyUnrecognized { count: 3 }, false)]
    fn transport_faults_are_classified(#[case] error: HandshakeError, #[case] expected: bool) {
        assert_eq!(expected, error.is_transport_fault());
    }
}
