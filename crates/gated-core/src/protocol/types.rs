//! Message type ids and the type → back-end module routing table.

/// Wire id of a typed message.
pub type MsgType = u32;

/// Client-facing reserved types. Handled by the gateway itself; everything
/// outside this set is forwarded opaquely.
pub mod client {
    use super::MsgType;

    pub const ERROR: MsgType = 130;
    pub const PING: MsgType = 131;
    pub const PONG: MsgType = 132;
    pub const LOGIN_REQ: MsgType = 133;
    pub const LOGOUT_REQ: MsgType = 134;
    pub const LOGOUT_RES: MsgType = 135;
    pub const KICKOUT: MsgType = 136;
}

/// Cluster-internal payloads carried over the broker.
pub mod cluster {
    use super::MsgType;

    pub const UNICAST: MsgType = 2001;
    pub const MULTICAST: MsgType = 2002;
    pub const BROADCAST: MsgType = 2003;
    pub const KICKOUT: MsgType = 2004;
    pub const ROUTER: MsgType = 2005;
    pub const USER_LOGIN: MsgType = 2006;
    pub const USER_LOGOUT: MsgType = 2007;
    pub const FORWARD: MsgType = 2008;
}

/// Server-initiated close reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickoutReason {
    ServiceClosed = 0,
    UserLogout = 1,
    LoginAnotherDevice = 2,
    Frozen = 3,
    Overflow = 4,
}

impl KickoutReason {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(KickoutReason::ServiceClosed),
            1 => Some(KickoutReason::UserLogout),
            2 => Some(KickoutReason::LoginAnotherDevice),
            3 => Some(KickoutReason::Frozen),
            4 => Some(KickoutReason::Overflow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KickoutReason::ServiceClosed => "ServiceClosed",
            KickoutReason::UserLogout => "UserLogout",
            KickoutReason::LoginAnotherDevice => "LoginAnotherDevice",
            KickoutReason::Frozen => "Frozen",
            KickoutReason::Overflow => "Overflow",
        }
    }
}

/// Back-end module that receives messages of the session/account range.
pub const MODULE_USER: &str = "user";

/// Inclusive type ranges owned by each back-end module. Routing a type not
/// covered here yields `UnrecognizedType`.
const MODULES: &[(MsgType, MsgType, &str)] = &[
    (1, 0x1FF, MODULE_USER),
    (0x200, 0x2FF, "chat"),
    (0x300, 0x3FF, "room"),
    (cluster::UNICAST, cluster::FORWARD, MODULE_USER),
];

/// Resolve the back-end module owning a message type.
pub fn module_of(typ: MsgType) -> Option<&'static str> {
    MODULES
        .iter()
        .find(|(lo, hi, _)| typ >= *lo && typ <= *hi)
        .map(|(_, _, name)| *name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reserved_types_route_to_user_module() {
        assert_eq!(module_of(client::PING), Some(MODULE_USER));
        assert_eq!(module_of(cluster::USER_LOGIN), Some(MODULE_USER));
    }

    #[test]
    fn app_ranges() {
        assert_eq!(module_of(0x200), Some("chat"));
        assert_eq!(module_of(0x2FF), Some("chat"));
        assert_eq!(module_of(0x300), Some("room"));
        assert_eq!(module_of(0x400), None);
        assert_eq!(module_of(0), None);
    }

    #[test]
    fn kickout_reason_round_trip() {
        for v in 0..5 {
            let r = KickoutReason::from_i32(v).unwrap();
            assert_eq!(r as i32, v);
        }
        assert!(KickoutReason::from_i32(5).is_none());
    }
}
