#![forbid(unsafe_code)]

//! Client-side pieces of taskpilot: the chat session controller with its
//! retry/cancel state machine, the transport seams it streams through,
//! and the direct task CRUD client.

pub mod cancel;
pub mod error;
pub mod session;
pub mod tasks;
pub mod transport;

pub use cancel::CancelToken;
pub use error::{ChatError, ChatErrorCode};
pub use session::{ChatSession, ChatSessionOptions, SessionPhase};
pub use tasks::{TasksClient, TasksClientError};
pub use transport::{
    ChatByteStream, ChatTransport, HttpChatTransport, HttpProposalSink, ProposalSink,
    TransportError,
};
