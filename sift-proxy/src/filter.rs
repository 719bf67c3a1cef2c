//! Filtering module: a narrow adapter over a rule engine
//!
//! The forwarder only ever talks to [`DnsFilter`]: match a domain, reduce the
//! matches to effective rules, apply `$dnsrewrite` values. The engine behind
//! the adapter is pluggable; the built-in [`HostListEngine`] understands the
//! host-list subset the proxy itself needs (plain and `||`-anchored domain
//! rules, `@@` exceptions, `$important`, `$dnsrewrite`, hosts-file entries,
//! `*` wildcards) and compiles the fallback-domain patterns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

use crate::config::{FilterParams, FilterList};

/// Match input: a normalized domain (lowercase, no trailing dot) or an IP
/// literal from an answer record
#[derive(Debug, Clone, Copy)]
pub struct MatchParam<'a> {
    pub domain: &'a str,
    pub rr_type: RecordType,
}

/// What a matched rule does
#[derive(Debug, Clone, PartialEq)]
pub enum RuleAction {
    /// Adblock-style block or `@@` exception
    Adblock { exception: bool, important: bool },
    /// Hosts-file entry: respond with this address
    Hosts(IpAddr),
    /// `$dnsrewrite` rule
    Dnsrewrite { exception: bool, rewrite: DnsRewrite },
}

/// Parsed `$dnsrewrite` value
#[derive(Debug, Clone, PartialEq)]
pub enum DnsRewrite {
    /// A bare RCODE (`NXDOMAIN`, `REFUSED`, `SERVFAIL`, `NOERROR`)
    Rcode(ResponseCode),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
}

/// Compiled matching pattern
#[derive(Debug, Clone, PartialEq)]
enum RulePattern {
    /// `|domain^`, a bare domain, or a hosts entry
    Exact(String),
    /// `||domain^`: the domain and all its subdomains
    DomainSuffix(String),
    /// Pattern containing `*`
    Glob(String),
}

impl RulePattern {
    fn matches(&self, domain: &str) -> bool {
        match self {
            RulePattern::Exact(p) => p == domain,
            RulePattern::DomainSuffix(p) => {
                domain == p || domain.strip_suffix(p).is_some_and(|head| head.ends_with('.'))
            }
            RulePattern::Glob(p) => wildcard_match(p, domain),
        }
    }
}

/// A single filtering rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub filter_id: i32,
    pub text: String,
    pub action: RuleAction,
    pattern: RulePattern,
}

impl Rule {
    pub fn is_exception(&self) -> bool {
        matches!(
            self.action,
            RuleAction::Adblock { exception: true, .. }
                | RuleAction::Dnsrewrite { exception: true, .. }
        )
    }

    fn is_important(&self) -> bool {
        matches!(self.action, RuleAction::Adblock { important: true, .. })
    }

    pub fn is_dnsrewrite(&self) -> bool {
        matches!(self.action, RuleAction::Dnsrewrite { .. })
    }
}

/// The engine seam: anything that can produce matching rules for a domain
pub trait RuleEngine: Send + Sync {
    fn match_request(&self, param: &MatchParam<'_>) -> Vec<Rule>;
}

/// Built-in engine over a flat list of compiled rules
pub struct HostListEngine {
    rules: Vec<Rule>,
}

impl HostListEngine {
    /// Compile filter lists; malformed lines become warnings, not errors
    pub fn compile(params: &FilterParams) -> (Self, Vec<String>) {
        let mut rules = Vec::new();
        let mut warnings = Vec::new();
        for list in &params.filters {
            for line in list.data.lines() {
                match parse_rule_line(list.id, line) {
                    None => {}
                    Some(Ok(rule)) => rules.push(rule),
                    Some(Err(reason)) => {
                        warnings.push(format!("filter {}: {}", list.id, reason));
                    }
                }
            }
        }
        (Self { rules }, warnings)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl RuleEngine for HostListEngine {
    fn match_request(&self, param: &MatchParam<'_>) -> Vec<Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches(param.domain))
            .cloned()
            .collect()
    }
}

/// Handle to an engine instance owned by the adapter
pub type FilterHandle = usize;

/// Narrow facade over rule engines
#[derive(Default)]
pub struct DnsFilter {
    engines: Vec<Option<Arc<dyn RuleEngine>>>,
}

impl DnsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine for `params`
    ///
    /// Returns the handle and an optional warning string; a `None` handle
    /// means the engine could not be created at all.
    pub fn create(&mut self, params: &FilterParams) -> (Option<FilterHandle>, Option<String>) {
        let (engine, warnings) = HostListEngine::compile(params);
        let warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("\n"))
        };
        let handle = self.engines.len();
        self.engines.push(Some(Arc::new(engine)));
        (Some(handle), warning)
    }

    /// Install an external engine behind the adapter
    pub fn create_with_engine(&mut self, engine: Arc<dyn RuleEngine>) -> FilterHandle {
        let handle = self.engines.len();
        self.engines.push(Some(engine));
        handle
    }

    pub fn destroy(&mut self, handle: Option<FilterHandle>) {
        if let Some(handle) = handle {
            if let Some(slot) = self.engines.get_mut(handle) {
                *slot = None;
            }
        }
    }

    /// Rules matching the given domain, in engine order
    pub fn match_request(&self, handle: FilterHandle, param: &MatchParam<'_>) -> Vec<Rule> {
        match self.engines.get(handle).and_then(|slot| slot.as_ref()) {
            Some(engine) => engine.match_request(param),
            None => Vec::new(),
        }
    }

    /// Check a single rule line for syntactic validity
    pub fn is_valid_rule(text: &str) -> bool {
        matches!(parse_rule_line(0, text), Some(Ok(_)))
    }
}

/// The reduced rule set for one match
#[derive(Debug, Default)]
pub struct EffectiveRules {
    pub dnsrewrite: Vec<Rule>,
    pub leftovers: Vec<Rule>,
}

/// Reduce matched rules: de-duplicate by text and order so the decisive rule
/// comes first (exceptions beat `$important` rules beat the rest)
pub fn get_effective_rules(rules: Vec<Rule>) -> EffectiveRules {
    let mut seen = std::collections::HashSet::new();
    let mut dnsrewrite = Vec::new();
    let mut leftovers = Vec::new();
    for rule in rules {
        if !seen.insert(rule.text.clone()) {
            continue;
        }
        if rule.is_dnsrewrite() {
            dnsrewrite.push(rule);
        } else {
            leftovers.push(rule);
        }
    }
    leftovers.sort_by_key(|rule| match () {
        _ if rule.is_exception() => 0,
        _ if rule.is_important() => 1,
        _ => 2,
    });
    EffectiveRules { dnsrewrite, leftovers }
}

/// Replacement value produced by `$dnsrewrite` rules
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteValue {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

/// Combined outcome of the applied `$dnsrewrite` rules
#[derive(Debug, Clone)]
pub struct RewriteInfo {
    pub rcode: ResponseCode,
    pub values: Vec<RewriteValue>,
    /// A CNAME to resolve through the upstreams before answering
    pub cname: Option<String>,
}

/// Result of [`apply_dnsrewrite_rules`]
#[derive(Debug)]
pub struct ApplyDnsrewriteResult {
    /// The rules that actually took effect
    pub rules: Vec<Rule>,
    /// `None` when an exception disabled rewriting
    pub rewrite_info: Option<RewriteInfo>,
}

/// Combine `$dnsrewrite` rules into one rewrite outcome
///
/// An exception wins over everything; a bare-RCODE rule wins over value
/// rules; a CNAME supersedes address values.
pub fn apply_dnsrewrite_rules(rules: &[Rule]) -> ApplyDnsrewriteResult {
    if let Some(exception) = rules.iter().find(|r| r.is_exception()) {
        return ApplyDnsrewriteResult {
            rules: vec![exception.clone()],
            rewrite_info: None,
        };
    }

    if let Some(rcode_rule) = rules.iter().find(|r| {
        matches!(
            &r.action,
            RuleAction::Dnsrewrite { rewrite: DnsRewrite::Rcode(code), .. } if *code != ResponseCode::NoError
        )
    }) {
        let RuleAction::Dnsrewrite { rewrite: DnsRewrite::Rcode(code), .. } = &rcode_rule.action
        else {
            unreachable!();
        };
        return ApplyDnsrewriteResult {
            rules: vec![rcode_rule.clone()],
            rewrite_info: Some(RewriteInfo {
                rcode: *code,
                values: Vec::new(),
                cname: None,
            }),
        };
    }

    let mut applied = Vec::new();
    let mut values = Vec::new();
    let mut cname = None;
    for rule in rules {
        let RuleAction::Dnsrewrite { rewrite, .. } = &rule.action else {
            continue;
        };
        match rewrite {
            DnsRewrite::A(addr) => values.push(RewriteValue::A(*addr)),
            DnsRewrite::Aaaa(addr) => values.push(RewriteValue::Aaaa(*addr)),
            DnsRewrite::Cname(target) => cname = Some(target.clone()),
            DnsRewrite::Rcode(_) => {}
        }
        applied.push(rule.clone());
    }
    if cname.is_some() {
        // The CNAME chain decides the answers.
        values.clear();
    }
    ApplyDnsrewriteResult {
        rules: applied,
        rewrite_info: Some(RewriteInfo {
            rcode: ResponseCode::NoError,
            values,
            cname,
        }),
    }
}

/// Characters allowed in fallback-domain patterns
const FALLBACK_PATTERN_CHARSET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-.*";

/// Compile fallback-domain patterns into filter parameters
///
/// Patterns with stray characters, or a wildcard in the final position, are
/// skipped with a debug log, matching the lenient handling of user-supplied
/// domain lists.
pub fn make_fallback_filter_params(fallback_domains: &[String]) -> FilterParams {
    let mut data = String::new();
    for pattern in fallback_domains {
        let p = pattern.trim();
        if p.is_empty() {
            continue;
        }
        if let Some(bad) = p.chars().find(|c| !FALLBACK_PATTERN_CHARSET.contains(*c)) {
            log::debug!("bad character '{}' in pattern '{}'", bad, pattern);
            continue;
        }
        if let Some(pos) = p.rfind('*') {
            if pos == p.len() - 1 {
                log::debug!("wildcard at the end of pattern '{}'", pattern);
                continue;
            }
        }
        let mut rule = String::new();
        if !p.starts_with('*') {
            rule.push('|');
        }
        rule.push_str(p);
        rule.push('^');
        if !DnsFilter::is_valid_rule(&rule) {
            log::debug!("pattern '{}' results in an invalid rule", pattern);
            continue;
        }
        data.push_str(&rule);
        data.push('\n');
    }
    FilterParams {
        filters: vec![FilterList { id: 0, data }],
    }
}

/// Iterative `*`-wildcard match, case already normalized
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Parse one rule line; `None` for comments and blanks
fn parse_rule_line(filter_id: i32, line: &str) -> Option<Result<Rule, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
        return None;
    }

    // Hosts-file form: "IP domain".
    if let Some((ip_part, domain_part)) = line.split_once(char::is_whitespace) {
        if let Ok(ip) = ip_part.parse::<IpAddr>() {
            let domain = domain_part.trim().to_lowercase();
            if domain.is_empty() || domain.contains(char::is_whitespace) {
                return Some(Err(format!("malformed hosts rule '{}'", line)));
            }
            return Some(Ok(Rule {
                filter_id,
                text: line.to_string(),
                action: RuleAction::Hosts(ip),
                pattern: RulePattern::Exact(domain),
            }));
        }
        return Some(Err(format!("unrecognized rule '{}'", line)));
    }

    let (exception, rest) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let (pattern_part, modifiers) = match rest.rsplit_once('$') {
        Some((p, m)) => (p, Some(m)),
        None => (rest, None),
    };

    let mut important = false;
    let mut rewrite = None;
    if let Some(modifiers) = modifiers {
        for modifier in modifiers.split(',') {
            if modifier == "important" {
                important = true;
            } else if let Some(value) = modifier.strip_prefix("dnsrewrite=") {
                match parse_dnsrewrite_value(value) {
                    Ok(r) => rewrite = Some(r),
                    Err(e) => return Some(Err(e)),
                }
            } else if modifier == "dnsrewrite" {
                // Exception form disabling all rewrites.
                rewrite = Some(DnsRewrite::Rcode(ResponseCode::NoError));
            } else {
                return Some(Err(format!("unsupported modifier '{}'", modifier)));
            }
        }
    }

    let pattern = match compile_pattern(pattern_part) {
        Some(p) => p,
        None => return Some(Err(format!("malformed pattern '{}'", pattern_part))),
    };

    let action = match rewrite {
        Some(rewrite) => RuleAction::Dnsrewrite { exception, rewrite },
        None => RuleAction::Adblock { exception, important },
    };

    Some(Ok(Rule {
        filter_id,
        text: line.to_string(),
        action,
        pattern,
    }))
}

fn compile_pattern(pattern: &str) -> Option<RulePattern> {
    let pattern = pattern.strip_suffix('^').unwrap_or(pattern);
    if let Some(rest) = pattern.strip_prefix("||") {
        let rest = rest.to_lowercase();
        if rest.is_empty() {
            return None;
        }
        return Some(if rest.contains('*') {
            RulePattern::Glob(format!("*{rest}"))
        } else {
            RulePattern::DomainSuffix(rest)
        });
    }
    let anchored = pattern.strip_prefix('|').unwrap_or(pattern).to_lowercase();
    if anchored.is_empty() {
        return None;
    }
    Some(if anchored.contains('*') {
        RulePattern::Glob(anchored)
    } else {
        RulePattern::Exact(anchored)
    })
}

fn parse_dnsrewrite_value(value: &str) -> Result<DnsRewrite, String> {
    // Full form: RCODE;RRTYPE;VALUE.
    let parts: Vec<&str> = value.split(';').collect();
    if parts.len() == 3 {
        if !parts[0].eq_ignore_ascii_case("NOERROR") {
            return parse_rcode(parts[0]).map(DnsRewrite::Rcode);
        }
        return match parts[1].to_ascii_uppercase().as_str() {
            "A" => parts[2]
                .parse()
                .map(DnsRewrite::A)
                .map_err(|_| format!("bad A value '{}'", parts[2])),
            "AAAA" => parts[2]
                .parse()
                .map(DnsRewrite::Aaaa)
                .map_err(|_| format!("bad AAAA value '{}'", parts[2])),
            "CNAME" => Ok(DnsRewrite::Cname(parts[2].to_lowercase())),
            other => Err(format!("unsupported rewrite rr type '{}'", other)),
        };
    }
    if parts.len() != 1 {
        return Err(format!("malformed dnsrewrite value '{}'", value));
    }

    if let Ok(code) = parse_rcode(value) {
        return Ok(DnsRewrite::Rcode(code));
    }
    if let Ok(v4) = value.parse::<Ipv4Addr>() {
        return Ok(DnsRewrite::A(v4));
    }
    if let Ok(v6) = value.parse::<Ipv6Addr>() {
        return Ok(DnsRewrite::Aaaa(v6));
    }
    Ok(DnsRewrite::Cname(value.to_lowercase()))
}

fn parse_rcode(value: &str) -> Result<ResponseCode, String> {
    match value.to_ascii_uppercase().as_str() {
        "NOERROR" => Ok(ResponseCode::NoError),
        "NXDOMAIN" => Ok(ResponseCode::NXDomain),
        "REFUSED" => Ok(ResponseCode::Refused),
        "SERVFAIL" => Ok(ResponseCode::ServFail),
        other => Err(format!("unsupported rcode '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(lines: &str) -> HostListEngine {
        let params = FilterParams {
            filters: vec![FilterList {
                id: 42,
                data: lines.to_string(),
            }],
        };
        HostListEngine::compile(&params).0
    }

    fn matches(engine: &HostListEngine, domain: &str) -> Vec<Rule> {
        engine.match_request(&MatchParam {
            domain,
            rr_type: RecordType::A,
        })
    }

    #[test]
    fn test_domain_suffix_rule() {
        let e = engine("||ads.example.com^\n");
        assert_eq!(matches(&e, "ads.example.com").len(), 1);
        assert_eq!(matches(&e, "tracker.ads.example.com").len(), 1);
        assert_eq!(matches(&e, "example.com").len(), 0);
        assert_eq!(matches(&e, "notads.example.com").len(), 0);
    }

    #[test]
    fn test_exact_rule() {
        let e = engine("|fritz.box^\n");
        assert_eq!(matches(&e, "fritz.box").len(), 1);
        assert_eq!(matches(&e, "sub.fritz.box").len(), 0);
    }

    #[test]
    fn test_exception_rule() {
        let e = engine("||example.com^\n@@||good.example.com^\n");
        let rules = matches(&e, "good.example.com");
        assert_eq!(rules.len(), 2);
        let effective = get_effective_rules(rules);
        assert!(effective.leftovers[0].is_exception());
    }

    #[test]
    fn test_hosts_rule() {
        let e = engine("0.0.0.0 blocked.example.org\n");
        let rules = matches(&e, "blocked.example.org");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].action,
            RuleAction::Hosts(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        );
    }

    #[test]
    fn test_wildcard_rule() {
        let e = engine("*.local^\n");
        assert_eq!(matches(&e, "router.local").len(), 1);
        assert_eq!(matches(&e, "a.b.local").len(), 1);
        assert_eq!(matches(&e, "local").len(), 0);
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let e = engine("! comment\n# other comment\n\n||real.example^\n");
        assert_eq!(e.rule_count(), 1);
    }

    #[test]
    fn test_dnsrewrite_values() {
        let e = engine(
            "||a.example^$dnsrewrite=1.2.3.4\n\
             ||b.example^$dnsrewrite=NXDOMAIN\n\
             ||c.example^$dnsrewrite=NOERROR;CNAME;real.example\n",
        );
        let a = &matches(&e, "a.example")[0];
        assert!(matches!(
            a.action,
            RuleAction::Dnsrewrite { rewrite: DnsRewrite::A(ip), .. } if ip == Ipv4Addr::new(1, 2, 3, 4)
        ));
        let b = &matches(&e, "b.example")[0];
        assert!(matches!(
            b.action,
            RuleAction::Dnsrewrite { rewrite: DnsRewrite::Rcode(ResponseCode::NXDomain), .. }
        ));
        let c = &matches(&e, "c.example")[0];
        assert!(matches!(
            c.action,
            RuleAction::Dnsrewrite { rewrite: DnsRewrite::Cname(ref t), .. } if t == "real.example"
        ));
    }

    #[test]
    fn test_apply_dnsrewrite_rcode_wins_over_values() {
        let e = engine("||x.example^$dnsrewrite=1.2.3.4\n||x.example^$dnsrewrite=REFUSED\n");
        let rules = matches(&e, "x.example");
        let result = apply_dnsrewrite_rules(&rules);
        let info = result.rewrite_info.unwrap();
        assert_eq!(info.rcode, ResponseCode::Refused);
        assert!(info.values.is_empty());
    }

    #[test]
    fn test_apply_dnsrewrite_cname_supersedes_addresses() {
        let e = engine("||x.example^$dnsrewrite=1.2.3.4\n||x.example^$dnsrewrite=NOERROR;CNAME;y.example\n");
        let rules = matches(&e, "x.example");
        let info = apply_dnsrewrite_rules(&rules).rewrite_info.unwrap();
        assert_eq!(info.cname.as_deref(), Some("y.example"));
        assert!(info.values.is_empty());
    }

    #[test]
    fn test_apply_dnsrewrite_exception_disables() {
        let e = engine("||x.example^$dnsrewrite=1.2.3.4\n@@||x.example^$dnsrewrite\n");
        let rules = matches(&e, "x.example");
        let result = apply_dnsrewrite_rules(&rules);
        assert!(result.rewrite_info.is_none());
        assert_eq!(result.rules.len(), 1);
        assert!(result.rules[0].is_exception());
    }

    #[test]
    fn test_effective_rules_dedup_and_order() {
        let e = engine("||dup.example^\n||dup.example^\n||dup.example^$important\n");
        let effective = get_effective_rules(matches(&e, "dup.example"));
        assert_eq!(effective.leftovers.len(), 2);
        assert!(effective.leftovers[0].is_important());
    }

    #[test]
    fn test_is_valid_rule() {
        assert!(DnsFilter::is_valid_rule("||example.com^"));
        assert!(DnsFilter::is_valid_rule("|example.com^"));
        assert!(DnsFilter::is_valid_rule("*.local^"));
        assert!(!DnsFilter::is_valid_rule("||^"));
        assert!(!DnsFilter::is_valid_rule("! comment"));
    }

    #[test]
    fn test_fallback_filter_params() {
        let domains = vec![
            "*.local".to_string(),
            "fritz.box".to_string(),
            "bad domain".to_string(),
            "trailing.wildcard.*".to_string(),
            "epdg.epc.*.pub.3gppnetwork.org".to_string(),
        ];
        let params = make_fallback_filter_params(&domains);
        let data = &params.filters[0].data;
        assert!(data.contains("*.local^"));
        assert!(data.contains("|fritz.box^"));
        assert!(data.contains("|epdg.epc.*.pub.3gppnetwork.org^"));
        assert!(!data.contains("bad domain"));
        assert!(!data.contains("trailing.wildcard"));

        let mut filter = DnsFilter::new();
        let (handle, warning) = filter.create(&params);
        assert!(warning.is_none());
        let handle = handle.unwrap();
        assert_eq!(
            filter
                .match_request(
                    handle,
                    &MatchParam { domain: "router.local", rr_type: RecordType::A }
                )
                .len(),
            1
        );
        assert_eq!(
            filter
                .match_request(
                    handle,
                    &MatchParam { domain: "example.com", rr_type: RecordType::A }
                )
                .len(),
            0
        );
    }

    #[test]
    fn test_destroyed_handle_matches_nothing() {
        let mut filter = DnsFilter::new();
        let (handle, _) = filter.create(&FilterParams {
            filters: vec![FilterList {
                id: 1,
                data: "||x.example^\n".into(),
            }],
        });
        filter.destroy(handle);
        assert!(filter
            .match_request(
                handle.unwrap(),
                &MatchParam { domain: "x.example", rr_type: RecordType::A }
            )
            .is_empty());
    }
}
