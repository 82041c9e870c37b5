//! Answering peers with `problem-report`.

use relay_proto::{protocols::problem_report::ProblemReport, AgentMessage, MessageType};

use crate::error::AgentError;

/// Problem report answering `inbound`, or `None` when `inbound` is itself a
/// problem report.
///
/// The report continues the inbound thread, unless `protocol` names a
/// different protocol than the inbound message's; then it opens a new
/// thread whose `pthid` is the offending `@id`.
pub fn problem_report_for(
    inbound: &AgentMessage,
    code: &str,
    description: &str,
    protocol: Option<&str>,
) -> Result<Option<AgentMessage>, AgentError> {
    if inbound.is::<ProblemReport>() {
        return Ok(None);
    }
    let report = AgentMessage::new(&ProblemReport::new(code, description))?;

    let same_protocol = match (protocol, inbound.parsed_type()) {
        (None, _) => true,
        (Some(protocol), Ok(inbound_type)) => protocol_matches(protocol, &inbound_type),
        (Some(_), Err(_)) => false,
    };
    let report = if same_protocol {
        report.reply_to(inbound)
    } else {
        report.with_parent_thread_id(inbound.id.clone())
    };
    Ok(Some(report))
}

/// `protocol` is either a protocol URI (`.../messagepickup/2.0`) or a bare
/// protocol name.
fn protocol_matches(protocol: &str, inbound: &MessageType) -> bool {
    if protocol == inbound.protocol_name {
        return true;
    }
    // Reuse the type parser by giving the protocol URI a dummy message name.
    match MessageType::parse(&format!("{protocol}/_")) {
        Ok(parsed) => parsed.same_protocol(inbound),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::protocols::{pickup::v2::StatusRequest, problem_report::codes};

    #[test]
    fn same_protocol_stays_on_thread() {
        let inbound = AgentMessage::new(&StatusRequest::default()).unwrap().with_thread_id("t-1");
        let report = problem_report_for(&inbound, codes::INTERNAL, "boom", None).unwrap().unwrap();
        assert_eq!(report.thread_id(), "t-1");
        assert_eq!(report.parent_thread_id(), None);

        let report = problem_report_for(&inbound, codes::INTERNAL, "boom", Some("https://didcomm.org/messagepickup/2.0"))
            .unwrap()
            .unwrap();
        assert_eq!(report.thread_id(), "t-1");
    }

    #[test]
    fn other_protocol_opens_child_thread() {
        let inbound = AgentMessage::new(&StatusRequest::default()).unwrap();
        let report = problem_report_for(&inbound, codes::INTERNAL, "boom", Some("coordinate-mediation"))
            .unwrap()
            .unwrap();
        assert_eq!(report.parent_thread_id(), Some(inbound.id.as_str()));
        assert_ne!(report.thread_id(), inbound.thread_id());
    }

    #[test]
    fn never_answers_a_problem_report() {
        let inbound = AgentMessage::new(&ProblemReport::new(codes::INTERNAL, "x")).unwrap();
        assert!(problem_report_for(&inbound, codes::INTERNAL, "y", None).unwrap().is_none());
    }
}
