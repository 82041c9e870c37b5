//! Typed bodies for the protocols this layer speaks.

pub mod mediation;
pub mod pickup;
pub mod problem_report;
pub mod routing;
pub mod trust_ping;

pub const DIDCOMM_DOC_URI: &str = "https://didcomm.org";
