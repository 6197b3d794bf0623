use std::{fmt, io, sync::Arc};

use relay_tunnel_proto::messages::{GlobalRequest, SessionMessage};

use super::SessionShared;

/// The peer's answer to a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    Success(Vec<u8>),
    Failure,
}

/// A global request from the peer, waiting for an answer.
///
/// Dropping it without answering replies with a failure, so the peer is never left waiting.
pub struct IncomingGlobalRequest {
    session: Option<Arc<SessionShared>>,
    name: String,
    want_reply: bool,
    payload: Vec<u8>,
}

impl IncomingGlobalRequest {
    pub(super) fn new(session: Arc<SessionShared>, name: String, want_reply: bool, payload: Vec<u8>) -> Self {
        Self {
            session: Some(session),
            name,
            want_reply,
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parses the request by name. Unknown names are not an error; see [`GlobalRequest::Unknown`].
    pub async fn parse(&self) -> io::Result<GlobalRequest> {
        GlobalRequest::parse(&self.name, &self.payload).await
    }

    pub fn reply_success(mut self, payload: Vec<u8>) {
        self.reply(GlobalReply::Success(payload));
    }

    pub fn reply_failure(mut self) {
        self.reply(GlobalReply::Failure);
    }

    fn reply(&mut self, reply: GlobalReply) {
        let Some(session) = self.session.take() else {
            return;
        };

        if self.want_reply {
            let message = match reply {
                GlobalReply::Success(payload) => SessionMessage::RequestSuccess { payload },
                GlobalReply::Failure => SessionMessage::RequestFailure,
            };

            let _ = session.send(message);
        }
    }
}

impl fmt::Debug for IncomingGlobalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingGlobalRequest")
            .field("name", &self.name)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Drop for IncomingGlobalRequest {
    fn drop(&mut self) {
        self.reply(GlobalReply::Failure);
    }
}
