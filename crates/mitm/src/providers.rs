//! LLM provider definitions: allowed endpoints, credential injection, and
//! sentinel keys.
//!
//! The sandboxed container only ever sees a sentinel — a format-matching
//! fake credential. The mapping from sentinel to real key lives in proxy
//! memory and nowhere else.

use std::collections::HashMap;

use {rand::Rng, secrecy::SecretString};

/// How the real key is injected into the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInjection {
    /// Replace the value of a named header (e.g. `x-api-key`).
    Header(&'static str),
    /// Replace the token of `Authorization: Bearer <token>`.
    Bearer,
}

/// One allowed `{method, path-pattern}` endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub method: &'static str,
    /// Exact path, or a pattern with single-segment `*` globs.
    pub path_pattern: &'static str,
}

/// A supported LLM provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub host: &'static str,
    pub display_name: &'static str,
    pub allowed_endpoints: Vec<Endpoint>,
    pub key_injection: KeyInjection,
    pub fake_key_prefix: &'static str,
}

impl ProviderConfig {
    /// Does `{method, path}` match any allowed endpoint?
    ///
    /// The query string is stripped first. Patterns are matched exactly,
    /// except that a `*` segment matches exactly one path segment.
    pub fn endpoint_allowed(&self, method: &str, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.allowed_endpoints.iter().any(|endpoint| {
            endpoint.method.eq_ignore_ascii_case(method) && path_matches(endpoint.path_pattern, path)
        })
    }
}

/// Exact match, or single-segment `*` globs. Literal segments are
/// regex-escaped so pattern dots never act as wildcards.
fn path_matches(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == path;
    }
    let mut expr = String::from("^");
    for (i, segment) in pattern.split('/').enumerate() {
        if i > 0 {
            expr.push('/');
        }
        if segment == "*" {
            expr.push_str("[^/]+");
        } else {
            expr.push_str(&regex::escape(segment));
        }
    }
    expr.push('$');
    regex::Regex::new(&expr).is_ok_and(|re| re.is_match(path))
}

/// The built-in provider table.
pub fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            host: "api.anthropic.com",
            display_name: "Anthropic",
            allowed_endpoints: vec![Endpoint {
                method: "POST",
                path_pattern: "/v1/messages",
            }],
            key_injection: KeyInjection::Header("x-api-key"),
            fake_key_prefix: "sk-ant-",
        },
        ProviderConfig {
            host: "api.openai.com",
            display_name: "OpenAI",
            allowed_endpoints: vec![
                Endpoint {
                    method: "POST",
                    path_pattern: "/v1/chat/completions",
                },
                Endpoint {
                    method: "GET",
                    path_pattern: "/v1/models",
                },
            ],
            key_injection: KeyInjection::Bearer,
            fake_key_prefix: "sk-",
        },
        ProviderConfig {
            host: "generativelanguage.googleapis.com",
            display_name: "Google",
            allowed_endpoints: vec![
                Endpoint {
                    method: "POST",
                    path_pattern: "/v1beta/models/*/generateContent",
                },
                Endpoint {
                    method: "POST",
                    path_pattern: "/v1beta/models/*/streamGenerateContent",
                },
            ],
            key_injection: KeyInjection::Header("x-goog-api-key"),
            fake_key_prefix: "AIza",
        },
    ]
}

/// Per-session sentinel → real-key mapping for one provider.
pub struct SentinelEntry {
    pub provider: ProviderConfig,
    pub sentinel: String,
    pub real_key: SecretString,
}

/// All sentinel mappings, keyed by provider host.
pub struct SentinelMap {
    entries: HashMap<String, SentinelEntry>,
}

impl SentinelMap {
    /// Build sentinels for every provider that has a configured real key.
    pub fn new(providers: Vec<ProviderConfig>, real_keys: HashMap<String, SecretString>) -> Self {
        let mut entries = HashMap::new();
        for provider in providers {
            let Some(real_key) = real_keys.get(provider.host) else {
                continue;
            };
            let sentinel = generate_sentinel(provider.fake_key_prefix);
            entries.insert(provider.host.to_string(), SentinelEntry {
                provider,
                sentinel,
                real_key: real_key.clone(),
            });
        }
        Self { entries }
    }

    pub fn get(&self, host: &str) -> Option<&SentinelEntry> {
        self.entries.get(host)
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// The environment variables handed to the sandboxed container: every
    /// provider's standard key variable set to its sentinel.
    pub fn container_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for entry in self.entries.values() {
            let var = match entry.provider.host {
                "api.anthropic.com" => "ANTHROPIC_API_KEY",
                "api.openai.com" => "OPENAI_API_KEY",
                "generativelanguage.googleapis.com" => "GEMINI_API_KEY",
                _ => continue,
            };
            env.insert(var.to_string(), entry.sentinel.clone());
        }
        env
    }

    /// Check a presented credential and return the real key on match.
    pub fn swap(&self, host: &str, presented: &str) -> Option<&SecretString> {
        let entry = self.entries.get(host)?;
        (entry.sentinel == presented).then_some(&entry.real_key)
    }
}

fn generate_sentinel(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..32)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("{prefix}{suffix}")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic() -> ProviderConfig {
        default_providers()
            .into_iter()
            .find(|p| p.host == "api.anthropic.com")
            .unwrap()
    }

    fn google() -> ProviderConfig {
        default_providers()
            .into_iter()
            .find(|p| p.host == "generativelanguage.googleapis.com")
            .unwrap()
    }

    #[test]
    fn exact_endpoint_matches_with_query_stripped() {
        let provider = anthropic();
        assert!(provider.endpoint_allowed("POST", "/v1/messages"));
        assert!(provider.endpoint_allowed("POST", "/v1/messages?beta=true"));
        assert!(provider.endpoint_allowed("post", "/v1/messages"));
        assert!(!provider.endpoint_allowed("GET", "/v1/messages"));
        assert!(!provider.endpoint_allowed("POST", "/v1/complete"));
    }

    #[test]
    fn glob_matches_exactly_one_segment() {
        let provider = google();
        assert!(provider.endpoint_allowed("POST", "/v1beta/models/gemini-pro/generateContent"));
        assert!(!provider.endpoint_allowed("POST", "/v1beta/models/generateContent"));
        assert!(!provider.endpoint_allowed(
            "POST",
            "/v1beta/models/a/b/generateContent"
        ));
    }

    #[test]
    fn glob_literals_are_not_regex() {
        // A dot in the pattern's literal segments must not match any char.
        let provider = ProviderConfig {
            host: "example.com",
            display_name: "Example",
            allowed_endpoints: vec![Endpoint {
                method: "GET",
                path_pattern: "/v1.0/*/status",
            }],
            key_injection: KeyInjection::Bearer,
            fake_key_prefix: "ex-",
        };
        assert!(provider.endpoint_allowed("GET", "/v1.0/x/status"));
        assert!(!provider.endpoint_allowed("GET", "/v1X0/x/status"));
    }

    #[test]
    fn sentinels_carry_the_provider_prefix() {
        let map = SentinelMap::new(
            default_providers(),
            HashMap::from([(
                "api.anthropic.com".to_string(),
                SecretString::new("sk-ant-real".into()),
            )]),
        );
        let entry = map.get("api.anthropic.com").unwrap();
        assert!(entry.sentinel.starts_with("sk-ant-"));
        assert_eq!(entry.sentinel.len(), "sk-ant-".len() + 32);
        // Providers without a configured key get no sentinel at all.
        assert!(map.get("api.openai.com").is_none());
    }

    #[test]
    fn swap_requires_the_exact_sentinel() {
        let map = SentinelMap::new(
            default_providers(),
            HashMap::from([(
                "api.anthropic.com".to_string(),
                SecretString::new("sk-ant-real".into()),
            )]),
        );
        let sentinel = map.get("api.anthropic.com").unwrap().sentinel.clone();
        assert!(map.swap("api.anthropic.com", &sentinel).is_some());
        assert!(map.swap("api.anthropic.com", "sk-ant-guessed").is_none());
        assert!(map.swap("api.openai.com", &sentinel).is_none());
    }

    #[test]
    fn container_env_holds_sentinels_not_real_keys() {
        let map = SentinelMap::new(
            default_providers(),
            HashMap::from([(
                "api.anthropic.com".to_string(),
                SecretString::new("sk-ant-real-secret".into()),
            )]),
        );
        let env = map.container_env();
        let value = &env["ANTHROPIC_API_KEY"];
        assert!(value.starts_with("sk-ant-"));
        assert_ne!(value, "sk-ant-real-secret");
    }
}
