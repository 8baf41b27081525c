//! Endpoint state and the error taxonomy of the channel protocol.

use thiserror::Error;

/// Terminal per-endpoint failures, reported through [`State::error`].
///
/// Once set, the endpoint stays errored until destroyed; the owning side
/// decides whether to recreate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// A flush carried an offset that was misaligned, unpublished, or out of
    /// the ring window.
    #[error("flush offset out of range")]
    InvalidOffset,
    /// A command record failed validation or was rejected by the decoder.
    #[error("malformed command")]
    MalformedCommand,
    /// The parent endpoint whose texture namespace this endpoint borrowed is
    /// gone.
    #[error("parent endpoint destroyed")]
    ParentLost,
    /// The endpoint's backing context went away (channel teardown path).
    #[error("context lost")]
    ContextLost,
}

impl EndpointError {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EndpointError::InvalidOffset => 1,
            EndpointError::MalformedCommand => 2,
            EndpointError::ParentLost => 3,
            EndpointError::ContextLost => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => EndpointError::InvalidOffset,
            2 => EndpointError::MalformedCommand,
            3 => EndpointError::ParentLost,
            4 => EndpointError::ContextLost,
            _ => return None,
        })
    }
}

/// Snapshot of one endpoint's consumer-side progress.
///
/// `token` advances once per processed flush; together with `get_offset` it
/// orders asynchronous state updates so a stale update can never overwrite a
/// newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct State {
    pub get_offset: u32,
    pub token: u32,
    pub error: Option<EndpointError>,
}

impl State {
    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether `self` is newer than `other` in token/get order.
    pub fn supersedes(&self, other: &State) -> bool {
        if self.token != other.token {
            return self.token.wrapping_sub(other.token) < u32::MAX / 2;
        }
        self.get_offset != other.get_offset
            && self.get_offset.wrapping_sub(other.get_offset) < u32::MAX / 2
    }
}

/// Faults a service reports back for a failed call. Wire-encodable subset of
/// [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallFault {
    /// Unknown routing id, unknown transfer buffer id, unknown bitmap, or a
    /// destroyed parent endpoint.
    #[error("unknown or destroyed handle")]
    InvalidHandle,
    /// The GPU process could not map or allocate the requested region.
    #[error("resource allocation failed")]
    ResourceExhausted,
    /// The endpoint is in a terminal error state.
    #[error("endpoint errored: {0}")]
    Endpoint(EndpointError),
    /// The operation is not valid for this endpoint kind or this service.
    #[error("operation not supported")]
    Unsupported,
}

/// Client-visible failure of a channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallError {
    /// The transport to the GPU process is severed; terminal for every
    /// endpoint on the channel.
    #[error("gpu channel lost")]
    ChannelLost,
    #[error("unknown or destroyed handle")]
    InvalidHandle,
    #[error("resource allocation failed")]
    ResourceExhausted,
    #[error("endpoint errored: {0}")]
    Endpoint(EndpointError),
    #[error("operation not supported")]
    Unsupported,
    /// The peer sent bytes that do not decode; treated as channel loss by
    /// callers since the stream can no longer be trusted.
    #[error("malformed message: {0}")]
    Decode(#[from] crate::wire::DecodeError),
    /// A reply arrived that does not match the outstanding call.
    #[error("unexpected reply to synchronous call")]
    UnexpectedReply,
}

impl From<CallFault> for CallError {
    fn from(fault: CallFault) -> Self {
        match fault {
            CallFault::InvalidHandle => CallError::InvalidHandle,
            CallFault::ResourceExhausted => CallError::ResourceExhausted,
            CallFault::Endpoint(e) => CallError::Endpoint(e),
            CallFault::Unsupported => CallError::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supersedes_orders_by_token_then_get() {
        let old = State { get_offset: 100, token: 1, error: None };
        let new = State { get_offset: 100, token: 2, error: None };
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));

        let same_token = State { get_offset: 164, token: 2, error: None };
        assert!(same_token.supersedes(&new));
        assert!(!new.supersedes(&same_token));
        assert!(!new.supersedes(&new));
    }

    #[test]
    fn supersedes_survives_counter_wrap() {
        let before = State { get_offset: 0, token: u32::MAX, error: None };
        let after = State { get_offset: 0, token: 0, error: None };
        assert!(after.supersedes(&before));
        assert!(!before.supersedes(&after));
    }
}
