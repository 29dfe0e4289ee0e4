//! Signal extraction: raw repository metadata to normalised classifier input.
//!
//! Extraction is total. Missing or malformed fields produce empty signals,
//! never errors, and every age is measured against the record's
//! `fetched_at` so the output depends on the record alone.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::model::{EntityRecord, SynopsisSource};

/// Longest synopsis kept, in characters
pub const MAX_SYNOPSIS_CHARS: usize = 300;

/// Structural facts derived from files and text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    HasCloudFormation,
    HasCdk,
    HasTerraform,
    HasSam,
    HasServerlessFramework,
    HasDockerfile,
    HasKubernetes,
    HasCi,
    HasTests,
    HasDocs,
    HasPackageManifest,
    HasReadme,
    MentionsLambda,
    MentionsGenAi,
}

impl Flag {
    pub fn name(&self) -> &'static str {
        match self {
            Flag::HasCloudFormation => "has_cloudformation",
            Flag::HasCdk => "has_cdk",
            Flag::HasTerraform => "has_terraform",
            Flag::HasSam => "has_sam",
            Flag::HasServerlessFramework => "has_serverless_framework",
            Flag::HasDockerfile => "has_dockerfile",
            Flag::HasKubernetes => "has_kubernetes",
            Flag::HasCi => "has_ci",
            Flag::HasTests => "has_tests",
            Flag::HasDocs => "has_docs",
            Flag::HasPackageManifest => "has_package_manifest",
            Flag::HasReadme => "has_readme",
            Flag::MentionsLambda => "mentions_lambda",
            Flag::MentionsGenAi => "mentions_genai",
        }
    }
}

/// Normalised signals for one repository
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBag {
    pub id: String,
    /// Name part of `owner/name`, lower-cased
    pub name: String,
    pub topics: BTreeSet<String>,
    /// Lower-cased root file names
    pub files: BTreeSet<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub age_days: Option<i64>,
    pub days_since_activity: Option<i64>,
    pub flags: BTreeSet<Flag>,
    pub synopsis: String,
    pub synopsis_source: SynopsisSource,
    name_text: String,
    description_text: String,
    readme_text: String,
}

/// Which text field a phrase is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Name,
    Description,
    Readme,
}

impl SignalBag {
    /// Whole-word phrase match; `phrase` is normalised like the field
    pub fn mentions(&self, field: TextField, phrase: &str) -> bool {
        let haystack = match field {
            TextField::Name => &self.name_text,
            TextField::Description => &self.description_text,
            TextField::Readme => &self.readme_text,
        };
        contains_phrase(haystack, phrase)
    }

    /// Exact file name, or a `*.ext` suffix pattern
    pub fn has_file(&self, pattern: &str) -> bool {
        match pattern.strip_prefix('*') {
            Some(suffix) => self.files.iter().any(|f| f.ends_with(suffix)),
            None => self.files.contains(pattern),
        }
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Derive the signal bag for a record
pub fn extract(record: &EntityRecord) -> SignalBag {
    let name = record
        .id
        .rsplit('/')
        .next()
        .unwrap_or(&record.id)
        .to_lowercase();
    let name_text = normalize(&name);

    let topics: BTreeSet<String> = record
        .topics
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let files: BTreeSet<String> = record
        .file_hints
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect();

    let readme = record.readme_excerpt.as_deref().unwrap_or("");
    let (synopsis, synopsis_source) = synopsis(record);

    let description_text = match synopsis_source {
        SynopsisSource::Identifier => String::new(),
        _ => normalize(&synopsis),
    };
    let readme_text = normalize(readme);

    let age_days = record
        .created_at
        .map(|c| (record.fetched_at - c).num_days().max(0));
    let days_since_activity = record
        .pushed_at
        .map(|p| (record.fetched_at - p).num_days().max(0));

    let mut bag = SignalBag {
        id: record.id.clone(),
        name,
        topics,
        files,
        language: record
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase),
        stars: record.stars,
        age_days,
        days_since_activity,
        flags: BTreeSet::new(),
        synopsis,
        synopsis_source,
        name_text,
        description_text,
        readme_text,
    };
    bag.flags = derive_flags(&bag, !readme.trim().is_empty());
    bag
}

fn derive_flags(bag: &SignalBag, has_readme: bool) -> BTreeSet<Flag> {
    let mut flags = BTreeSet::new();
    let any_text = |phrase: &str| {
        bag.mentions(TextField::Description, phrase)
            || bag.mentions(TextField::Readme, phrase)
            || bag.topics.contains(phrase)
    };

    if bag.has_file("*.template")
        || bag.has_file("cloudformation")
        || bag.has_file("template.json")
        || any_text("cloudformation")
    {
        flags.insert(Flag::HasCloudFormation);
    }
    if bag.has_file("cdk.json") || bag.topics.contains("aws-cdk") || any_text("aws cdk") {
        flags.insert(Flag::HasCdk);
    }
    if bag.has_file("*.tf") || bag.has_file(".terraform.lock.hcl") || any_text("terraform") {
        flags.insert(Flag::HasTerraform);
    }
    if bag.has_file("samconfig.toml")
        || (bag.has_file("template.yaml") && any_text("sam"))
        || any_text("aws sam")
    {
        flags.insert(Flag::HasSam);
    }
    if bag.has_file("serverless.yml") || bag.has_file("serverless.yaml") {
        flags.insert(Flag::HasServerlessFramework);
    }
    if bag.has_file("dockerfile") || bag.has_file("docker-compose.yml") || bag.has_file("docker-compose.yaml") {
        flags.insert(Flag::HasDockerfile);
    }
    if bag.has_file("chart.yaml")
        || bag.has_file("kustomization.yaml")
        || bag.has_file("k8s")
        || bag.has_file("helm")
        || any_text("kubernetes")
    {
        flags.insert(Flag::HasKubernetes);
    }
    if bag.has_file(".github")
        || bag.has_file(".gitlab-ci.yml")
        || bag.has_file("buildspec.yml")
        || bag.has_file("jenkinsfile")
        || bag.has_file(".travis.yml")
    {
        flags.insert(Flag::HasCi);
    }
    if bag.has_file("tests") || bag.has_file("test") || bag.has_file("spec") || bag.has_file("__tests__") {
        flags.insert(Flag::HasTests);
    }
    if bag.has_file("docs") || bag.has_file("mkdocs.yml") || bag.has_file("documentation") {
        flags.insert(Flag::HasDocs);
    }
    const MANIFESTS: &[&str] = &[
        "package.json",
        "requirements.txt",
        "pyproject.toml",
        "setup.py",
        "go.mod",
        "cargo.toml",
        "pom.xml",
        "build.gradle",
        "gemfile",
        "composer.json",
    ];
    if MANIFESTS.iter().any(|m| bag.has_file(m)) {
        flags.insert(Flag::HasPackageManifest);
    }
    if has_readme {
        flags.insert(Flag::HasReadme);
    }
    if any_text("lambda") || any_text("aws lambda") || bag.topics.contains("aws-lambda") {
        flags.insert(Flag::MentionsLambda);
    }
    const GENAI: &[&str] = &[
        "genai",
        "generative ai",
        "llm",
        "llms",
        "bedrock",
        "anthropic",
        "openai",
        "langchain",
        "rag",
        "agentic",
    ];
    if GENAI.iter().any(|k| any_text(k)) {
        flags.insert(Flag::MentionsGenAi);
    }
    flags
}

// === Synopsis ===

/// Pick the synopsis: description, then readme, then the identifier
pub fn synopsis(record: &EntityRecord) -> (String, SynopsisSource) {
    if let Some(desc) = record.description.as_deref().map(str::trim) {
        if !desc.is_empty() {
            return (collapse_whitespace(desc), SynopsisSource::Description);
        }
    }
    if let Some(summary) = record.readme_excerpt.as_deref().and_then(readme_summary) {
        return (summary, SynopsisSource::Readme);
    }
    (title_from_id(&record.id), SynopsisSource::Identifier)
}

static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static REF_LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\[[^\]]*\]").unwrap());
static HTML_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static EMPHASIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__|~~|`)").unwrap());
static STAR_EM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\s][^*]*)\*").unwrap());
static RULE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([-*_=]\s*){3,}$").unwrap());
static SENTENCE_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?](\s|$)").unwrap());

/// First sentence of the first prose paragraph of a README
pub fn readme_summary(readme: &str) -> Option<String> {
    let mut in_fence = false;
    let mut paragraph: Vec<&str> = Vec::new();

    for raw in readme.lines() {
        let line = raw.trim();

        if line.starts_with("```") || line.starts_with("~~~") {
            in_fence = !in_fence;
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if in_fence {
            continue;
        }
        if line.is_empty() {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if is_decoration(line) {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        paragraph.push(line);
    }

    let text = clean_markdown(&paragraph.join(" "));
    if text.is_empty() {
        return None;
    }

    let sentence = match SENTENCE_END_RE.find(&text) {
        Some(m) => text[..m.start() + 1].to_string(),
        None => text,
    };
    Some(truncate_chars(&sentence, MAX_SYNOPSIS_CHARS))
}

/// Headings, badges, images, link-only lines, HTML, rules, tables
fn is_decoration(line: &str) -> bool {
    if line.starts_with('#')
        || line.starts_with('!')
        || line.starts_with("[!")
        || line.starts_with('<')
        || line.starts_with('|')
        || line.starts_with('>')
        || line.starts_with('=')
        || RULE_RE.is_match(line)
    {
        return true;
    }
    // Nothing left once links are removed: a link-only line
    let without_links = LINK_RE.replace_all(line, "");
    without_links
        .chars()
        .all(|c| c.is_whitespace() || matches!(c, '|' | '-' | '*' | '•' | '·' | ','))
}

fn clean_markdown(text: &str) -> String {
    let text = LINK_RE.replace_all(text, "$1");
    let text = REF_LINK_RE.replace_all(&text, "$1");
    let text = HTML_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    let text = STAR_EM_RE.replace_all(&text, "$1");
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// `org/my-cool_tool.js` -> `My Cool Tool Js`
pub fn title_from_id(id: &str) -> String {
    let name = id.rsplit('/').next().unwrap_or(id);
    let title = name
        .split(|c: char| c == '-' || c == '_' || c == '.' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let mut chars = t.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        id.to_string()
    } else {
        title
    }
}

// === Text normalisation ===

/// Lower-case, non-alphanumerics to single spaces, padded for phrase matching
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let needle = normalize(phrase);
    if needle.trim().is_empty() {
        return false;
    }
    haystack.contains(&needle)
}
