pub mod collab;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod turns;

pub use collab::{
    CaseAccess, CaseDirectory, CaseMode, Evaluator, Grounded, MessageLedger, Reasoner, Seat,
};
pub use errors::{
    AdmissionError, CollaboratorError, DeliveryError, DirectoryError, InboundError, LedgerError,
    TurnError,
};
pub use ids::{CaseId, ConnectionId, MessageId, ParticipantId};
pub use messages::{Message, MessageKind};
pub use turns::{Party, PartyKind, Scores, TranscriptEntry, TurnState, TurnStatus};
