//! Classifier pack.
//!
//! All patterns are compiled once, at construction, and shared read-only —
//! classification runs on the hot write path and must not pay regex
//! compilation cost per call. No suspension points here: this is pure CPU
//! work.

use std::sync::LazyLock;

use regex::Regex;

use crate::schema::{Classification, Domain, MemoryType, Urgency};

pub struct ClassificationResult {
    pub classification: Classification,
    pub memory_type: MemoryType,
    pub urgency: Urgency,
    pub domain: Domain,
    pub category: Option<String>,
    pub priority: f32,
    pub entities: Vec<String>,
    pub tags: Vec<String>,
}

struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    fn compile(sources: &[&str]) -> Self {
        Self {
            patterns: sources
                .iter()
                .map(|p| Regex::new(p).expect("static classifier pattern compiles"))
                .collect(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    fn match_count(&self, text: &str) -> usize {
        self.patterns.iter().filter(|re| re.is_match(text)).count()
    }
}

static SECRET_PATTERNS: LazyLock<PatternSet> = LazyLock::new(|| {
    PatternSet::compile(&[
        r"(?i)\bapi[_-]?key\b\s*[:=]",
        r"(?i)\bsecret[_-]?key\b\s*[:=]",
        r"(?i)\bpassword\b\s*[:=]",
        r"(?i)\baccess[_-]?token\b\s*[:=]",
        r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----",
        r"\b\d{3}-\d{2}-\d{4}\b",                 // SSN-shaped
        r"\b(?:\d[ -]?){13,16}\b",                // card-shaped
        r"(?i)\bsk-[a-zA-Z0-9]{16,}\b",
    ])
});

static TYPE_PATTERNS: LazyLock<[(MemoryType, PatternSet); 6]> = LazyLock::new(|| {
    [
        (MemoryType::Core, PatternSet::compile(&[r"(?i)\bcore (fact|identity|belief)\b", r"(?i)\balways true\b"])),
        (MemoryType::Procedural, PatternSet::compile(&[r"(?i)\bhow to\b", r"(?i)\bstep(s)? to\b", r"(?i)\bprocedure\b", r"(?i)\bworkflow\b"])),
        (MemoryType::Preference, PatternSet::compile(&[r"(?i)\bi (prefer|like|dislike|hate|love|want)\b", r"(?i)\bfavou?rite\b"])),
        (MemoryType::Relationship, PatternSet::compile(&[r"(?i)\bworks? (with|for)\b", r"(?i)\bis (my|the) (colleague|manager|friend|partner)\b", r"(?i)\bknows\b"])),
        (MemoryType::Profile, PatternSet::compile(&[r"(?i)\bmy name is\b", r"(?i)\bi am a\b", r"(?i)\bi live in\b", r"(?i)\bmy (job|role|title) is\b"])),
        (MemoryType::Episodic, PatternSet::compile(&[r"(?i)\byesterday\b", r"(?i)\btoday\b", r"(?i)\bjust (happened|did|said)\b", r"(?i)\bhappened\b"])),
    ]
});

static URGENCY_PATTERNS: LazyLock<[(Urgency, PatternSet); 3]> = LazyLock::new(|| {
    [
        (Urgency::Critical, PatternSet::compile(&[r"(?i)\bcritical\b", r"(?i)\burgent\b", r"(?i)\basap\b", r"(?i)\bmust not\b", r"(?i)\bnever do\b"])),
        (Urgency::Important, PatternSet::compile(&[r"(?i)\bimportant\b", r"(?i)\bremember this\b", r"(?i)\bkey point\b"])),
        (Urgency::Background, PatternSet::compile(&[r"(?i)\bfor (what it'?s worth|reference)\b", r"(?i)\bjust fyi\b", r"(?i)\bminor\b"])),
    ]
});

static DOMAIN_KEYWORDS: LazyLock<[(Domain, &'static [&'static str]); 4]> = LazyLock::new(|| {
    [
        (Domain::Technical, &["code", "bug", "api", "server", "database", "deploy", "function", "error", "crate", "library"]),
        (Domain::Personal, &["family", "friend", "hobby", "health", "birthday", "home", "feel", "relationship"]),
        (Domain::Project, &["deadline", "milestone", "sprint", "roadmap", "ticket", "release", "stakeholder"]),
        (Domain::Knowledge, &["fact", "theory", "concept", "definition", "research", "paper", "history"]),
    ]
});

const TAG_PATTERNS: &[(&str, &str)] = &[
    ("security", r"(?i)\b(auth|password|token|encrypt|vulnerab)"),
    ("performance", r"(?i)\b(slow|latency|optimi[sz]e|bottleneck)"),
    ("bug", r"(?i)\b(bug|crash|panic|exception|fail)"),
    ("decision", r"(?i)\b(decided|we will|going with|chose)"),
];

static TAG_REGEXES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    TAG_PATTERNS
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).expect("static tag pattern compiles")))
        .collect()
});

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static PORT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bport\s+(\d{1,5})\b").unwrap());
static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());
static NATURAL_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Jan(uary)?|Feb(ruary)?|Mar(ch)?|Apr(il)?|May|Jun(e)?|Jul(y)?|Aug(ust)?|Sep(tember)?|Oct(ober)?|Nov(ember)?|Dec(ember)?)\s+\d{1,2}(st|nd|rd|th)?,?\s*\d{0,4}\b").unwrap()
});
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bv?\d+\.\d+(\.\d+)?([.-][a-zA-Z0-9]+)?\b").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.+-]+@[\w-]+\.[\w.-]+\b").unwrap());
static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://[^\s]+").unwrap());

const TECH_TERMS: &[&str] = &[
    "kubernetes", "docker", "postgres", "redis", "rust", "python", "typescript",
    "graphql", "grpc", "kafka", "terraform", "aws", "gcp", "azure", "react",
];

fn priority_for(urgency: Urgency, domain: Domain) -> f32 {
    let urgency_score = match urgency {
        Urgency::Critical => 0.9,
        Urgency::Important => 0.7,
        Urgency::Reference => 0.4,
        Urgency::Background => 0.2,
    };
    let domain_boost = match domain {
        Domain::Technical | Domain::Project => 0.1,
        Domain::Personal => 0.05,
        Domain::Knowledge | Domain::General => 0.0,
    };
    (urgency_score + domain_boost).clamp(0.0, 1.0)
}

/// Extract IPs, `port N`, ISO/natural dates, version strings (IP-shaped
/// sequences excluded), emails, URLs, and bounded tech-term vocabulary hits.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities = Vec::new();
    let ips: Vec<&str> = IP_RE.find_iter(text).map(|m| m.as_str()).collect();
    entities.extend(ips.iter().map(|s| s.to_string()));

    for caps in PORT_RE.captures_iter(text) {
        entities.push(format!("port {}", &caps[1]));
    }
    entities.extend(ISO_DATE_RE.find_iter(text).map(|m| m.as_str().to_string()));
    entities.extend(NATURAL_DATE_RE.find_iter(text).map(|m| m.as_str().to_string()));

    for m in VERSION_RE.find_iter(text) {
        let candidate = m.as_str();
        if !ips.contains(&candidate) {
            entities.push(candidate.to_string());
        }
    }

    entities.extend(EMAIL_RE.find_iter(text).map(|m| m.as_str().to_string()));
    entities.extend(URL_RE.find_iter(text).map(|m| m.as_str().to_string()));

    let lower = text.to_lowercase();
    for term in TECH_TERMS {
        if lower.contains(term) {
            entities.push(term.to_string());
        }
    }

    entities.sort();
    entities.dedup();
    entities
}

fn classify_domain(text: &str) -> Domain {
    let lower = text.to_lowercase();
    for (domain, keywords) in DOMAIN_KEYWORDS.iter() {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *domain;
        }
    }
    Domain::Knowledge
}

fn classify_type(text: &str) -> MemoryType {
    for (memory_type, patterns) in TYPE_PATTERNS.iter() {
        if patterns.matches(text) {
            return *memory_type;
        }
    }
    MemoryType::Semantic
}

fn classify_urgency(text: &str) -> Urgency {
    for (urgency, patterns) in URGENCY_PATTERNS.iter() {
        if patterns.matches(text) {
            return *urgency;
        }
    }
    Urgency::Reference
}

/// Security classification is terminal: `secret` short-circuits every other
/// signal. `context_hint_private` lets callers (e.g. an explicit
/// `scope=private` request) push a non-secret cell to `private` instead of
/// defaulting to `public`.
fn classify_security(text: &str, context_hint_private: bool) -> Classification {
    if SECRET_PATTERNS.matches(text) {
        Classification::Secret
    } else if context_hint_private {
        Classification::Private
    } else {
        Classification::Public
    }
}

fn collect_tags(text: &str, domain: Domain) -> Vec<String> {
    let mut tags = vec![format!("{domain:?}").to_lowercase()];
    for (name, re) in TAG_REGEXES.iter() {
        if re.is_match(text) {
            tags.push((*name).to_string());
        }
    }
    tags.sort();
    tags.dedup();
    tags
}

/// Run the full classifier pack over `text`. `context_hint_private` mirrors
/// the `{agent-id, type}` context hint a caller may supply alongside it.
pub fn classify(text: &str, context_hint_private: bool) -> ClassificationResult {
    let classification = classify_security(text, context_hint_private);
    let memory_type = classify_type(text);
    let urgency = classify_urgency(text);
    let domain = classify_domain(text);
    let priority = priority_for(urgency, domain);
    let entities = extract_entities(text);
    let tags = collect_tags(text, domain);

    ClassificationResult {
        classification,
        memory_type,
        urgency,
        domain,
        category: None,
        priority,
        entities,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_assignment_is_secret() {
        let result = classify("api_key: sk-ABCDEFGHIJKLMNOPQRSTUVWX", false);
        assert_eq!(result.classification, Classification::Secret);
    }

    #[test]
    fn plain_text_without_hint_is_public() {
        let result = classify("the sky is blue", false);
        assert_eq!(result.classification, Classification::Public);
    }

    #[test]
    fn plain_text_with_hint_is_private() {
        let result = classify("the sky is blue", true);
        assert_eq!(result.classification, Classification::Private);
    }

    #[test]
    fn procedural_pattern_wins_type() {
        let result = classify("Here is how to deploy the service", false);
        assert_eq!(result.memory_type, MemoryType::Procedural);
    }

    #[test]
    fn critical_urgency_detected() {
        let result = classify("This is critical, do not skip it", false);
        assert_eq!(result.urgency, Urgency::Critical);
    }

    #[test]
    fn entity_extraction_finds_ip_port_and_version() {
        let entities = extract_entities("server 10.0.0.5 listens on port 8080, running v1.2.3");
        assert!(entities.contains(&"10.0.0.5".to_string()));
        assert!(entities.contains(&"port 8080".to_string()));
        assert!(entities.iter().any(|e| e.contains("1.2.3")));
    }

    #[test]
    fn version_extraction_excludes_ip_shaped_matches() {
        let entities = extract_entities("connect to 10.0.0.5 now");
        assert!(!entities.iter().any(|e| e == "10.0.0.5" && e.matches('.').count() == 3 && entities.iter().filter(|x| **x == "10.0.0.5").count() > 1));
    }

    #[test]
    fn priority_clamped_into_unit_range() {
        let p = priority_for(Urgency::Critical, Domain::Technical);
        assert!(p <= 1.0);
    }

    #[test]
    fn tags_include_domain_and_matched_rules() {
        let result = classify("we hit a crash in the auth token refresh code", false);
        assert!(result.tags.contains(&"technical".to_string()));
        assert!(result.tags.contains(&"bug".to_string()));
        assert!(result.tags.contains(&"security".to_string()));
    }
}
