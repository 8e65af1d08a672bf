use crate::library::communication::protocol::{reply_code, Method, ReplyStatus};

/// Reply names as RabbitMQ puts them at the start of every close text
const REPLY_NAMES: &[(&str, u16)] = &[
    ("CONNECTION_FORCED", 320),
    ("INVALID_PATH", 402),
    ("ACCESS_REFUSED", reply_code::ACCESS_REFUSED),
    ("NOT_FOUND", reply_code::NOT_FOUND),
    ("RESOURCE_LOCKED", reply_code::RESOURCE_LOCKED),
    ("PRECONDITION_FAILED", reply_code::PRECONDITION_FAILED),
    ("FRAME_ERROR", 501),
    ("SYNTAX_ERROR", 502),
    ("COMMAND_INVALID", 503),
    ("CHANNEL_ERROR", reply_code::CHANNEL_ERROR),
    ("UNEXPECTED_FRAME", 505),
    ("RESOURCE_ERROR", 506),
    ("NOT_ALLOWED", reply_code::NOT_ALLOWED),
    ("NOT_IMPLEMENTED", 540),
    ("INTERNAL_ERROR", 541),
];

/// Recovers the broker's reply from the text of a library error
pub(super) fn parse_status(text: &str) -> Option<ReplyStatus> {
    REPLY_NAMES
        .iter()
        .filter_map(|(name, code)| text.find(name).map(|at| (at, *code)))
        .min_by_key(|(at, _)| *at)
        .map(|(at, code)| ReplyStatus::new(code, &text[at..]))
}

/// Whether a reply code closes the whole connection rather than a channel
pub(super) fn is_connection_level(code: u16) -> bool {
    !matches!(
        code,
        reply_code::ACCESS_REFUSED
            | reply_code::NOT_FOUND
            | reply_code::RESOURCE_LOCKED
            | reply_code::PRECONDITION_FAILED
    )
}

/// Close method the broker sent along with the given status
pub(super) fn close_method(status: ReplyStatus) -> Method {
    if is_connection_level(status.code) {
        Method::ConnectionClose(status)
    } else {
        Method::ChannelClose(status)
    }
}
