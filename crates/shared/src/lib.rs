//! Dicelog Shared - Wire contract between the game client and the engine
//!
//! Plain serde types only. Domain ids are flattened to their raw integers so
//! that the JSON shape is exactly what the client expects.

pub mod requests;
pub mod responses;

pub use requests::{DeadLetterQuery, RollRequest, SessionStatsQuery, StatsScopeQuery};
pub use responses::{
    CriticalCounts, CurrentSessionResponse, DeadLetterDto, ErrorResponse, PlayerAverage, QueueStatus,
    RequeueResponse, RollDto, SessionAverage, SessionRollsResponse, SessionStartedResponse,
    StatusResponse,
};
