//! Domain model.

pub mod code;
pub mod errors;
pub mod ids;
pub mod job;
pub mod order;
pub mod schedule;
pub mod session;

pub use code::{CodeKind, CodeMessage, CodeRequest, channel_name};
pub use errors::{ErrorKind, ProcessError};
pub use ids::{Id, IdMarker, JobId, OperatorId, OrderId};
pub use job::{
    Backoff, HEAD_PRIORITY, Job, JobKind, JobOptions, JobPayload, OrderJobData, StatusCheckJobData,
};
pub use order::{NewOrder, Order, OrderStatus, OrderUpdate};
pub use schedule::{ActiveInterval, GateDecision, ScheduleRecord};
pub use session::{Cookie, Credentials, Operator, Session};
