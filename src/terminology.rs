use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Canonical term -> variant spellings observed for it.
pub type TermMap = BTreeMap<String, BTreeSet<String>>;

/// Any spelling (canonical or variant) -> its canonical spelling.
pub type AliasIndex = HashMap<String, String>;

static ANNOTATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!--\s*merged[\s_-]*terms\s*:?\s*(.*?)-->").expect("annotation regex")
});
static ARROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*[-*]?\s*(.+?)\s*(?:->|=>|→)\s*"?([^"]+?)"?\s*[,;]?\s*$"#).expect("arrow regex")
});
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)""#).expect("quoted regex"));
static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*){2,}").expect("blank run regex"));

#[derive(Clone, Debug, Deserialize)]
struct ClusterJson {
    canonical: String,
    #[serde(default)]
    variants: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum VariantsJson {
    Many(Vec<String>),
    One(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum AnnotationJson {
    Clusters(Vec<ClusterJson>),
    Map(BTreeMap<String, VariantsJson>),
}

/// Shape used when rewriting annotation comments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AnnotationStyle {
    /// Keep whatever shape the first annotation in the text uses.
    #[default]
    Auto,
    Json,
    Arrow,
}

fn add_term(map: &mut TermMap, canonical: &str, variants: impl IntoIterator<Item = String>) {
    let canonical = canonical.trim();
    if canonical.is_empty() {
        return;
    }
    let entry = map.entry(canonical.to_string()).or_default();
    for v in variants {
        let v = v.trim();
        if !v.is_empty() && v != canonical {
            entry.insert(v.to_string());
        }
    }
}

/// Parse the body of one merged-terms annotation; JSON first, then arrow pairs.
pub fn parse_annotation_body(body: &str) -> TermMap {
    let mut map = TermMap::new();
    let trimmed = body.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        match serde_json::from_str::<AnnotationJson>(trimmed) {
            Ok(AnnotationJson::Clusters(items)) => {
                for item in items {
                    add_term(&mut map, &item.canonical, item.variants);
                }
                return map;
            }
            Ok(AnnotationJson::Map(items)) => {
                for (canonical, variants) in items {
                    let variants = match variants {
                        VariantsJson::Many(v) => v,
                        VariantsJson::One(v) => vec![v],
                    };
                    add_term(&mut map, &canonical, variants);
                }
                return map;
            }
            Err(err) => {
                log::debug!("merged-terms annotation is not valid JSON ({err}); trying arrow pairs");
            }
        }
    }

    for line in trimmed.lines() {
        let Some(caps) = ARROW_RE.captures(line) else {
            continue;
        };
        let left = caps.get(1).map_or("", |m| m.as_str());
        let canonical = caps.get(2).map_or("", |m| m.as_str());
        let quoted: Vec<String> = QUOTED_RE
            .captures_iter(left)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        let variants = if quoted.is_empty() {
            left.split(',').map(|s| s.trim().to_string()).collect()
        } else {
            quoted
        };
        add_term(&mut map, canonical, variants);
    }
    map
}

/// Collect every merged-terms annotation in `text` into one map.
pub fn extract_merged_terms_map(text: &str) -> TermMap {
    let mut out = TermMap::new();
    for caps in ANNOTATION_RE.captures_iter(text) {
        let body = caps.get(1).map_or("", |m| m.as_str());
        merge_term_maps(&mut out, &parse_annotation_body(body));
    }
    out
}

/// Union `extra` into `target`.
pub fn merge_term_maps(target: &mut TermMap, extra: &TermMap) {
    for (canonical, variants) in extra {
        add_term(target, canonical, variants.iter().cloned());
    }
}

/// Variants of `current` that `known` does not yet list under the same canonical.
pub fn diff_term_maps(current: &TermMap, known: &TermMap) -> TermMap {
    let mut out = TermMap::new();
    for (canonical, variants) in current {
        let seen = known.get(canonical);
        let fresh: BTreeSet<String> = variants
            .iter()
            .filter(|v| {
                v.as_str() != canonical.as_str() && !seen.is_some_and(|s| s.contains(v.as_str()))
            })
            .cloned()
            .collect();
        if !fresh.is_empty() {
            out.insert(canonical.clone(), fresh);
        }
    }
    out
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
    }
}

/// Merge clusters linked through canonical/variant overlap until no canonical key is a
/// variant of another cluster.
///
/// Each merged cluster keeps the member that no other member lists as a variant; ties go to
/// the case-insensitively smallest spelling.
pub fn coalesce_term_map(map: &TermMap) -> TermMap {
    let keys: Vec<&String> = map.keys().collect();
    let pos: HashMap<&str, usize> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| (k.as_str(), i))
        .collect();

    let mut sets = DisjointSet::new(keys.len());
    let mut has_incoming = vec![false; keys.len()];
    for (i, key) in keys.iter().enumerate() {
        for v in &map[*key] {
            if let Some(&j) = pos.get(v.as_str()) {
                if j != i {
                    sets.union(i, j);
                    has_incoming[j] = true;
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..keys.len() {
        let root = sets.find(i);
        groups.entry(root).or_default().push(i);
    }

    let mut out = TermMap::new();
    for members in groups.values() {
        let pick = |candidates: &mut dyn Iterator<Item = usize>| {
            candidates.min_by(|&a, &b| {
                (keys[a].to_lowercase(), keys[a])
                    .cmp(&(keys[b].to_lowercase(), keys[b]))
            })
        };
        let rep = pick(&mut members.iter().copied().filter(|&i| !has_incoming[i]))
            .or_else(|| pick(&mut members.iter().copied()));
        let Some(rep) = rep else {
            continue;
        };
        let canonical = keys[rep].clone();
        let mut variants = BTreeSet::new();
        for &m in members {
            variants.insert(keys[m].clone());
            variants.extend(map[keys[m]].iter().cloned());
        }
        variants.remove(&canonical);
        out.insert(canonical, variants);
    }
    out
}

pub fn build_alias_index(map: &TermMap) -> AliasIndex {
    let mut idx = AliasIndex::new();
    for (canonical, variants) in map {
        for v in variants {
            idx.insert(v.clone(), canonical.clone());
        }
    }
    for canonical in map.keys() {
        idx.insert(canonical.clone(), canonical.clone());
    }
    idx
}

/// Re-key `map` so every key is the canonical spelling from `index`.
pub fn remap_keys_to_canonical(map: &TermMap, index: &AliasIndex) -> TermMap {
    let mut out = TermMap::new();
    for (key, variants) in map {
        let canonical = index.get(key).unwrap_or(key);
        let mut moved: Vec<String> = variants.iter().cloned().collect();
        if canonical != key {
            moved.push(key.clone());
        }
        add_term(&mut out, canonical, moved);
    }
    out.retain(|_, v| !v.is_empty());
    out
}

fn sorted_canonicals(map: &TermMap) -> Vec<(&String, &BTreeSet<String>)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| (a.0.to_lowercase(), a.0).cmp(&(b.0.to_lowercase(), b.0)));
    entries
}

fn json_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Compact `{"Canonical":["v1","v2"]}` hint string; empty when there are no terms.
pub fn serialize_term_hints_json(map: &TermMap) -> String {
    let entries: Vec<String> = sorted_canonicals(map)
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(canonical, variants)| {
            let list: Vec<String> = variants.iter().map(|v| json_str(v)).collect();
            format!("{}:[{}]", json_str(canonical), list.join(","))
        })
        .collect();
    if entries.is_empty() {
        return String::new();
    }
    format!("{{{}}}", entries.join(","))
}

fn render_annotation(map: &TermMap, style: AnnotationStyle) -> String {
    let entries = sorted_canonicals(map);
    match style {
        AnnotationStyle::Arrow => {
            let lines: Vec<String> = entries
                .into_iter()
                .map(|(canonical, variants)| {
                    let left: Vec<String> = variants.iter().map(|v| json_str(v)).collect();
                    format!("{} -> {}", left.join(", "), json_str(canonical))
                })
                .collect();
            format!("<!-- merged terms:\n{}\n-->", lines.join("\n"))
        }
        AnnotationStyle::Json | AnnotationStyle::Auto => {
            let items: Vec<String> = entries
                .into_iter()
                .map(|(canonical, variants)| {
                    let list: Vec<String> = variants.iter().map(|v| json_str(v)).collect();
                    format!(
                        "{{\"canonical\":{},\"variants\":[{}]}}",
                        json_str(canonical),
                        list.join(",")
                    )
                })
                .collect();
            format!("<!-- merged terms: [{}] -->", items.join(","))
        }
    }
}

/// Replace merged-terms annotations in `text` with one listing only `only_new`.
///
/// With nothing new, every annotation is removed.
pub fn rewrite_merged_terms_comments(text: &str, only_new: &TermMap, style: AnnotationStyle) -> String {
    let Some(first) = ANNOTATION_RE.captures(text) else {
        return text.to_string();
    };
    let style = match style {
        AnnotationStyle::Auto => {
            let body = first.get(1).map_or("", |m| m.as_str()).trim_start();
            if body.starts_with('[') || body.starts_with('{') {
                AnnotationStyle::Json
            } else {
                AnnotationStyle::Arrow
            }
        }
        fixed => fixed,
    };

    let replacement = if only_new.is_empty() {
        String::new()
    } else {
        render_annotation(only_new, style)
    };
    let mut placed = false;
    let rewritten = ANNOTATION_RE.replace_all(text, |_: &regex::Captures| {
        if placed {
            String::new()
        } else {
            placed = true;
            replacement.clone()
        }
    });
    BLANK_RUN_RE
        .replace_all(&rewritten, "\n\n")
        .trim_end()
        .to_string()
}

/// Document-scoped glossary of term merges.
#[derive(Clone, Debug, Default)]
pub struct TermGlossary {
    known: TermMap,
}

/// Result of folding one rewritten fragment into the glossary.
#[derive(Clone, Debug, Default)]
pub struct TermFold {
    pub text: String,
    /// Merges first seen in this fragment, keyed by current canonical spelling.
    pub new_terms: TermMap,
}

impl TermGlossary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn known(&self) -> &TermMap {
        &self.known
    }

    #[must_use]
    pub fn hints(&self) -> String {
        serialize_term_hints_json(&coalesce_term_map(&self.known))
    }

    /// Absorb the annotations of a rewritten fragment and trim them to what is new.
    pub fn fold_fragment(&mut self, rewritten: &str) -> TermFold {
        let current = extract_merged_terms_map(rewritten);
        if current.is_empty() {
            return TermFold {
                text: rewritten.to_string(),
                new_terms: TermMap::new(),
            };
        }

        let only_new = diff_term_maps(&current, &self.known);
        let mut combined = self.known.clone();
        merge_term_maps(&mut combined, &current);
        let combined = coalesce_term_map(&combined);
        let index = build_alias_index(&combined);
        let new_terms = remap_keys_to_canonical(&only_new, &index);
        let text = rewrite_merged_terms_comments(rewritten, &new_terms, AnnotationStyle::Auto);

        merge_term_maps(&mut self.known, &current);
        self.known = coalesce_term_map(&self.known);
        log::debug!(
            "terms: {} new merges, {} clusters known",
            new_terms.values().map(BTreeSet::len).sum::<usize>(),
            self.known.len()
        );
        TermFold { text, new_terms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tm(items: &[(&str, &[&str])]) -> TermMap {
        let mut m = TermMap::new();
        for (c, vs) in items {
            add_term(&mut m, c, vs.iter().map(|s| s.to_string()));
        }
        m
    }

    #[test]
    fn extracts_json_array_annotation() {
        let text = "Body.\n<!-- merged terms: [{\"canonical\": \"Kubernetes\", \"variants\": [\"kubernetis\", \"k8s\"]}] -->";
        let m = extract_merged_terms_map(text);
        assert_eq!(m, tm(&[("Kubernetes", &["k8s", "kubernetis"])]));
    }

    #[test]
    fn extracts_json_object_annotation() {
        let text = "<!-- merged_terms: {\"Docker\": [\"docker\", \"Doker\"], \"Git\": \"git\"} -->";
        let m = extract_merged_terms_map(text);
        assert_eq!(m, tm(&[("Docker", &["Doker", "docker"]), ("Git", &["git"])]));
    }

    #[test]
    fn extracts_arrow_pairs() {
        let text = "<!-- Merged terms:\n\"postgres\", \"postgre\" -> \"PostgreSQL\"\n- \"reddis\" -> \"Redis\"\n-->";
        let m = extract_merged_terms_map(text);
        assert_eq!(
            m,
            tm(&[("PostgreSQL", &["postgre", "postgres"]), ("Redis", &["reddis"])])
        );
    }

    #[test]
    fn broken_json_falls_back_to_arrows() {
        let m = parse_annotation_body("[\"a\" -> \"A\"");
        assert!(m.is_empty() || m.contains_key("A"));
    }

    #[test]
    fn coalesce_merges_transitively() {
        let m = tm(&[("A", &["b"]), ("b", &["c"]), ("c", &["d"]), ("X", &["y"])]);
        let out = coalesce_term_map(&m);
        assert_eq!(out, tm(&[("A", &["b", "c", "d"]), ("X", &["y"])]));
    }

    #[test]
    fn coalesce_handles_cycles() {
        let m = tm(&[("beta", &["Alpha"]), ("Alpha", &["beta", "gamma"])]);
        let out = coalesce_term_map(&m);
        assert_eq!(out, tm(&[("Alpha", &["beta", "gamma"])]));
    }

    #[test]
    fn coalesce_is_idempotent() {
        let m = tm(&[("K8s", &["Kubernetes"]), ("Kubernetes", &["kube"]), ("Go", &["golang"])]);
        let once = coalesce_term_map(&m);
        assert_eq!(coalesce_term_map(&once), once);
    }

    #[test]
    fn diff_reports_only_unknown_variants() {
        let known = tm(&[("A", &["a1"])]);
        let current = tm(&[("A", &["a1", "a2"]), ("B", &["b1"])]);
        let d = diff_term_maps(&current, &known);
        assert_eq!(d, tm(&[("A", &["a2"]), ("B", &["b1"])]));

        let mut merged = known.clone();
        merge_term_maps(&mut merged, &d);
        assert!(diff_term_maps(&current, &merged).is_empty());
    }

    #[test]
    fn remap_uses_current_canonical() {
        let combined = tm(&[("Kubernetes", &["k8s", "kube"])]);
        let idx = build_alias_index(&combined);
        assert_eq!(idx["kube"], "Kubernetes");
        let out = remap_keys_to_canonical(&tm(&[("k8s", &["kube"])]), &idx);
        assert_eq!(out, tm(&[("Kubernetes", &["k8s", "kube"])]));
    }

    #[test]
    fn hints_are_sorted_case_insensitively() {
        let m = tm(&[("beta", &["B2", "b1"]), ("Alpha", &["a"]), ("Empty", &[])]);
        assert_eq!(
            serialize_term_hints_json(&m),
            r#"{"Alpha":["a"],"beta":["B2","b1"]}"#
        );
        assert_eq!(serialize_term_hints_json(&TermMap::new()), "");
    }

    #[test]
    fn rewrite_keeps_only_new_items_in_original_style() {
        let text = "Para.\n\n<!-- merged terms:\n\"k8s\" -> \"Kubernetes\"\n\"dokker\" -> \"Docker\"\n-->\n\nMore.";
        let only_new = tm(&[("Docker", &["dokker"])]);
        let out = rewrite_merged_terms_comments(text, &only_new, AnnotationStyle::Auto);
        assert_eq!(out, "Para.\n\n<!-- merged terms:\n\"dokker\" -> \"Docker\"\n-->\n\nMore.");
    }

    #[test]
    fn rewrite_removes_annotations_when_nothing_is_new() {
        let text = "Para.\n\n<!-- merged terms: {\"A\": [\"a\"]} -->\n\nMore.";
        let out = rewrite_merged_terms_comments(text, &TermMap::new(), AnnotationStyle::Auto);
        assert_eq!(out, "Para.\n\nMore.");
    }

    #[test]
    fn glossary_folds_fragments() {
        let mut g = TermGlossary::new();
        let first = g.fold_fragment("One.\n<!-- merged terms: {\"Kubernetes\": [\"k8s\"]} -->");
        assert_eq!(first.new_terms, tm(&[("Kubernetes", &["k8s"])]));
        assert!(first.text.contains("\"k8s\""));

        let second = g.fold_fragment("Two.\n<!-- merged terms: {\"Kubernetes\": [\"k8s\"]} -->");
        assert!(second.new_terms.is_empty());
        assert_eq!(second.text, "Two.");
        assert_eq!(g.hints(), r#"{"Kubernetes":["k8s"]}"#);

        let third = g.fold_fragment("Three.\n<!-- merged terms: {\"k8s\": [\"kube\"]} -->");
        assert_eq!(third.new_terms, tm(&[("Kubernetes", &["k8s", "kube"])]));
        assert_eq!(g.known(), &tm(&[("Kubernetes", &["k8s", "kube"])]));
    }
}
