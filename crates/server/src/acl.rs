//! Access control for messages entering a session's history

use scribble_protocol::{Message, MessageType};

/// What the filter needs to know about the sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderRole {
    pub operator: bool,
    pub deputy: bool,
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(&'static str),
}

/// Decides whether a message from a joined client may be accepted
pub trait CommandFilter: Send {
    fn check(&self, sender: SenderRole, msg: &Message) -> Verdict;
}

/// Types only the server itself generates
const SERVER_ONLY: &[MessageType] = &[MessageType::USER_JOIN, MessageType::USER_LEAVE];

const OPERATOR_ONLY: &[MessageType] = &[
    MessageType::SESSION_OWNER,
    MessageType::TRUSTED_USERS,
    MessageType::SOFT_RESET,
    MessageType::USER_ACL,
    MessageType::FEATURE_ACCESS_LEVELS,
    MessageType::DEFAULT_LAYER,
];

/// Operator types deputies may use too
const DEPUTY_ALLOWED: &[MessageType] = &[MessageType::LAYER_ACL];

#[derive(Debug, Default)]
pub struct SessionAcl;

impl CommandFilter for SessionAcl {
    fn check(&self, sender: SenderRole, msg: &Message) -> Verdict {
        let kind = msg.kind();
        if SERVER_ONLY.contains(&kind) {
            return Verdict::Reject("server generated message");
        }
        let deputy_ok = DEPUTY_ALLOWED.contains(&kind);
        if (OPERATOR_ONLY.contains(&kind) || deputy_ok)
            && !(sender.operator || (sender.deputy && deputy_ok))
        {
            return Verdict::Reject("operator only");
        }
        if sender.muted && matches!(kind, MessageType::CHAT | MessageType::PRIVATE_CHAT) {
            return Verdict::Reject("muted");
        }
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageType) -> Message {
        Message::empty(kind, 1)
    }

    const USER: SenderRole = SenderRole {
        operator: false,
        deputy: false,
        muted: false,
    };

    #[test]
    fn drawing_is_open_to_everyone() {
        assert_eq!(SessionAcl.check(USER, &msg(MessageType::PEN_UP)), Verdict::Accept);
    }

    #[test]
    fn operator_types_need_operator() {
        let op = SenderRole {
            operator: true,
            ..USER
        };
        assert!(matches!(
            SessionAcl.check(USER, &msg(MessageType::SESSION_OWNER)),
            Verdict::Reject(_)
        ));
        assert_eq!(SessionAcl.check(op, &msg(MessageType::SESSION_OWNER)), Verdict::Accept);
    }

    #[test]
    fn deputies_may_change_layer_acl() {
        let deputy = SenderRole {
            deputy: true,
            ..USER
        };
        assert_eq!(SessionAcl.check(deputy, &msg(MessageType::LAYER_ACL)), Verdict::Accept);
        assert!(matches!(
            SessionAcl.check(USER, &msg(MessageType::LAYER_ACL)),
            Verdict::Reject(_)
        ));
        assert!(matches!(
            SessionAcl.check(deputy, &msg(MessageType::USER_ACL)),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn muted_users_cannot_chat() {
        let muted = SenderRole { muted: true, ..USER };
        assert_eq!(SessionAcl.check(muted, &msg(MessageType::CHAT)), Verdict::Reject("muted"));
        assert_eq!(SessionAcl.check(muted, &msg(MessageType::PEN_UP)), Verdict::Accept);
    }

    #[test]
    fn nobody_may_forge_joins() {
        let op = SenderRole {
            operator: true,
            ..USER
        };
        assert!(matches!(
            SessionAcl.check(op, &msg(MessageType::USER_JOIN)),
            Verdict::Reject(_)
        ));
    }
}
