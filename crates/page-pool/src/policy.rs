//! Interception policy: which network requests a rendering page may make.

/// Rules applied to every intercepted request of a render.
///
/// Pure data; the same value is shared by all sessions of a pool.
#[derive(Clone, Debug, Default)]
pub struct InterceptPolicy {
    /// Suffix-matched host allow-list. Empty means every domain is allowed.
    pub allowed_domains: Vec<String>,
    /// Drop web font requests.
    pub block_fonts: bool,
}

/// The parts of a paused request the policy looks at.
#[derive(Clone, Copy, Debug)]
pub struct InterceptedRequest<'a> {
    pub host: &'a str,
    pub resource_type: &'a str,
    pub is_main_document: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Continue,
    Fail,
}

impl InterceptPolicy {
    /// Whether request interception needs to be enabled at all.
    pub fn active(&self) -> bool {
        self.block_fonts || !self.allowed_domains.is_empty()
    }

    /// Is `host` admitted by the allow-list? The primary navigation host is
    /// checked separately and always admitted.
    pub fn domain_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{domain}")))
    }

    /// Decide one intercepted request. The main document always continues,
    /// whatever the other rules say.
    pub fn decide(&self, primary_host: &str, request: &InterceptedRequest<'_>) -> Decision {
        if request.is_main_document {
            return Decision::Continue;
        }
        if !self.allowed_domains.is_empty()
            && request.host != primary_host
            && !self.domain_allowed(request.host)
        {
            return Decision::Fail;
        }
        if self.block_fonts && request.resource_type.eq_ignore_ascii_case("font") {
            return Decision::Fail;
        }
        Decision::Continue
    }
}
