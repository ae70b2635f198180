//! Stable broker status codes.
//!
//! Codes are part of the operational contract: they appear in rejected
//! setup messages, broker logs, and operator notifications, and must
//! not change meaning across releases.

/// Closed set of status codes emitted by the registry core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCode {
    /// Setup composite metadata failed to parse.
    MetadataParse,
    /// Missing or invalid authentication credentials.
    Unauthenticated,
    /// Responder handler construction failed.
    ResponderConstruct,
    /// An instance with the same id is already connected.
    DuplicateInstance,
    /// App uuid does not satisfy the minimum shape.
    MalformedUuid,
    /// Setup carried no app descriptor metadata.
    MissingAppDescriptor,
    /// Unexpected internal failure during admission.
    Internal,
    /// Connection accepted (log only).
    AcceptOk,
    /// Responder handler disposed (log only).
    Disposed,
    /// App connected (operator notification).
    AppConnectedNote,
    /// App stopped (operator notification).
    AppStoppedNote,
}

impl BrokerCode {
    /// The wire-stable code string.
    pub fn code(self) -> &'static str {
        match self {
            Self::MetadataParse => "RST-500402",
            Self::Unauthenticated => "RST-500405",
            Self::ResponderConstruct => "RST-500406",
            Self::DuplicateInstance => "RST-500409",
            Self::MalformedUuid => "RST-500410",
            Self::MissingAppDescriptor => "RST-500411",
            Self::Internal => "RST-600500",
            Self::AcceptOk => "RST-500200",
            Self::Disposed => "RST-500202",
            Self::AppConnectedNote => "RST-300203",
            Self::AppStoppedNote => "RST-300204",
        }
    }

    fn template(self) -> &'static str {
        match self {
            Self::MetadataParse => "setup metadata parse failure: {}",
            Self::Unauthenticated => "missing or invalid authentication credentials",
            Self::ResponderConstruct => "responder construction failed: {}",
            Self::DuplicateInstance => "application instance already connected",
            Self::MalformedUuid => "malformed app uuid: {}",
            Self::MissingAppDescriptor => "app descriptor metadata missing",
            Self::Internal => "unexpected internal failure: {}",
            Self::AcceptOk => "app '{}' accepted",
            Self::Disposed => "responder handler disposed",
            Self::AppConnectedNote => "app '{}' connected from {}",
            Self::AppStoppedNote => "app '{}' stopped from {}",
        }
    }

    /// Render the code-prefixed message, filling `{}` placeholders in
    /// order. Missing arguments render empty; extras are ignored.
    pub fn message(self, args: &[&str]) -> String {
        let mut out = String::from(self.code());
        out.push(' ');
        let mut parts = self.template().split("{}");
        if let Some(first) = parts.next() {
            out.push_str(first);
        }
        let mut args = args.iter();
        for part in parts {
            out.push_str(args.next().copied().unwrap_or(""));
            out.push_str(part);
        }
        out
    }
}

impl std::fmt::Display for BrokerCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BrokerCode::Unauthenticated.code(), "RST-500405");
        assert_eq!(BrokerCode::DuplicateInstance.code(), "RST-500409");
        assert_eq!(BrokerCode::Internal.code(), "RST-600500");
    }

    #[test]
    fn message_fills_placeholders_in_order() {
        let msg = BrokerCode::AppConnectedNote.message(&["svc-a", "10.0.0.1"]);
        assert_eq!(msg, "RST-300203 app 'svc-a' connected from 10.0.0.1");
    }

    #[test]
    fn message_echoes_offending_uuid() {
        let msg = BrokerCode::MalformedUuid.message(&["short"]);
        assert_eq!(msg, "RST-500410 malformed app uuid: short");
    }

    #[test]
    fn missing_arguments_render_empty() {
        let msg = BrokerCode::MalformedUuid.message(&[]);
        assert_eq!(msg, "RST-500410 malformed app uuid: ");
    }
}
