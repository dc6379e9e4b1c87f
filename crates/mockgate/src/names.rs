//! Fixed wire names shared across the gateway: header names carrying the
//! routing metadata, internal path prefixes, and reserved stub priorities.

/// Request headers the transport layer must supply on every proxied call.
pub mod headers {
    /// Names the logical upstream the caller wants to reach.
    pub const TARGET_SERVICE: &str = "x-mock-target-service";
    /// Names the test session the caller belongs to.
    pub const SESSION_ID: &str = "x-mock-session-id";
}

/// Paths served by the gateway itself and exempt from admission.
pub mod paths {
    pub const API_PREFIX: &str = "/_gateway-api";
}

/// Reserved priority values. Lower value wins.
pub mod priorities {
    /// Reserved for operator-installed rules that must beat anything
    /// user-created. The gateway never installs these itself; create one
    /// through the stub API with `"priority": 1` and no session header to
    /// make it global.
    pub const SYSTEM: i32 = 1;
    /// Default priority for user-created rules.
    pub const DEFAULT: i32 = 2;
    /// Catch-all proxy fallback; a hit at this priority is not a stub hit.
    pub const PROXY_FALLBACK: i32 = 1000;
}

/// True for paths handled by the gateway's own API surface.
pub fn is_internal_path(path: &str) -> bool {
    path.starts_with(paths::API_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_paths_are_detected() {
        assert!(is_internal_path("/_gateway-api/stubs"));
        assert!(is_internal_path("/_gateway-api/health"));
        assert!(!is_internal_path("/api/orders"));
        assert!(!is_internal_path("/"));
    }
}
