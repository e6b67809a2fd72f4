use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step in a field path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Location of a field inside an object body, rendered `a.b[0].c`
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldPath(pub Vec<Segment>);

impl FieldPath {
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Only the difference reported at that very path
    Exact,
    /// The path and everything below it, on a segment boundary
    #[default]
    Prefix,
}

/// A field the platform or its defaulting logic may legitimately change.
///
/// `*` as a key matches any single key, `[*]` matches any index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IgnoreRule {
    pub path: String,
    #[serde(default, rename = "match")]
    pub mode: MatchMode,
}

impl IgnoreRule {
    pub fn exact(path: &str) -> IgnoreRule {
        IgnoreRule {
            path: path.to_string(),
            mode: MatchMode::Exact,
        }
    }

    pub fn prefix(path: &str) -> IgnoreRule {
        IgnoreRule {
            path: path.to_string(),
            mode: MatchMode::Prefix,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Pattern {
    Key(String),
    AnyKey,
    Index(usize),
    AnyIndex,
}

impl Pattern {
    fn matches(&self, seg: &Segment) -> bool {
        match (self, seg) {
            (Pattern::Key(p), Segment::Key(k)) => p == k,
            (Pattern::AnyKey, Segment::Key(_)) => true,
            (Pattern::Index(p), Segment::Index(i)) => p == i,
            (Pattern::AnyIndex, Segment::Index(_)) => true,
            _ => false,
        }
    }
}

fn parse_pattern(path: &str) -> Result<Vec<Pattern>> {
    let bad = |why: &str| Error::Config(format!("invalid ignore path `{path}`: {why}"));
    let mut out = Vec::new();
    for token in path.split('.') {
        let (key, mut rest) = match token.find('[') {
            Some(i) => (&token[..i], &token[i..]),
            None => (token, ""),
        };
        if key.is_empty() {
            return Err(bad("empty key"));
        }
        out.push(if key == "*" {
            Pattern::AnyKey
        } else {
            Pattern::Key(key.to_string())
        });
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(bad("expected `[`"));
            }
            let end = rest.find(']').ok_or_else(|| bad("unclosed `[`"))?;
            let idx = &rest[1..end];
            out.push(if idx == "*" {
                Pattern::AnyIndex
            } else {
                Pattern::Index(idx.parse().map_err(|_| bad("index is not a number"))?)
            });
            rest = &rest[end + 1..];
        }
    }
    Ok(out)
}

#[derive(Clone, Debug)]
struct CompiledRule {
    patterns: Vec<Pattern>,
    mode: MatchMode,
}

impl CompiledRule {
    fn matches(&self, path: &FieldPath) -> bool {
        let segs = path.segments();
        let len_ok = match self.mode {
            MatchMode::Exact => segs.len() == self.patterns.len(),
            MatchMode::Prefix => segs.len() >= self.patterns.len(),
        };
        len_ok && self.patterns.iter().zip(segs).all(|(p, s)| p.matches(s))
    }
}

/// Platform defaulted fields that builders usually leave alone
const DEFAULT_IGNORES: &[(&str, MatchMode)] = &[
    ("spec.template.metadata.creationTimestamp", MatchMode::Exact),
    ("spec.template.metadata.annotations", MatchMode::Prefix),
    ("spec.template.spec.schedulerName", MatchMode::Exact),
    ("spec.template.spec.dnsPolicy", MatchMode::Exact),
    ("spec.template.spec.restartPolicy", MatchMode::Exact),
    ("spec.template.spec.securityContext", MatchMode::Prefix),
    ("spec.template.spec.terminationGracePeriodSeconds", MatchMode::Exact),
    ("spec.template.spec.containers[*].terminationMessagePath", MatchMode::Exact),
    ("spec.template.spec.containers[*].terminationMessagePolicy", MatchMode::Exact),
    ("spec.template.spec.containers[*].imagePullPolicy", MatchMode::Exact),
    ("spec.template.spec.containers[*].ports[*].protocol", MatchMode::Exact),
    ("spec.template.spec.containers[*].*.successThreshold", MatchMode::Exact),
    ("spec.template.spec.containers[*].*.failureThreshold", MatchMode::Exact),
    ("spec.template.spec.containers[*].*.periodSeconds", MatchMode::Exact),
    ("spec.template.spec.containers[*].*.timeoutSeconds", MatchMode::Exact),
    ("spec.template.spec.containers[*].*.httpGet.scheme", MatchMode::Exact),
    ("spec.template.spec.volumes[*].*.defaultMode", MatchMode::Exact),
    ("spec.progressDeadlineSeconds", MatchMode::Exact),
    ("spec.revisionHistoryLimit", MatchMode::Exact),
    ("spec.strategy", MatchMode::Prefix),
    ("spec.volumeMode", MatchMode::Exact),
    ("spec.volumeName", MatchMode::Exact),
    ("spec.clusterIP", MatchMode::Exact),
    ("spec.clusterIPs", MatchMode::Prefix),
    ("spec.ipFamilies", MatchMode::Prefix),
    ("spec.ipFamilyPolicy", MatchMode::Exact),
    ("spec.internalTrafficPolicy", MatchMode::Exact),
    ("spec.sessionAffinity", MatchMode::Exact),
    ("spec.ports[*].protocol", MatchMode::Exact),
    ("spec.ports[*].targetPort", MatchMode::Exact),
];

pub fn default_ignore_rules() -> Vec<IgnoreRule> {
    DEFAULT_IGNORES
        .iter()
        .map(|(path, mode)| IgnoreRule {
            path: path.to_string(),
            mode: *mode,
        })
        .collect()
}

/// Ordered list of ignore rules
#[derive(Clone, Debug, Default)]
pub struct IgnorePolicy {
    rules: Vec<CompiledRule>,
}

impl IgnorePolicy {
    pub fn new(rules: &[IgnoreRule]) -> Result<IgnorePolicy> {
        let rules = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    patterns: parse_pattern(&r.path)?,
                    mode: r.mode,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IgnorePolicy { rules })
    }

    pub fn is_ignored(&self, path: &FieldPath) -> bool {
        self.rules.iter().any(|r| r.matches(path))
    }

    /// Whether every path below `path` is ignored too
    fn covers_subtree(&self, path: &FieldPath) -> bool {
        self.rules
            .iter()
            .any(|r| r.mode == MatchMode::Prefix && r.matches(path))
    }
}

/// One path where live and expected state disagree
#[derive(Clone, Debug, PartialEq)]
pub struct DriftEntry {
    pub path: FieldPath,
    pub live: Option<Value>,
    pub expected: Option<Value>,
    pub ignored: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
    /// A depth or count bound was hit
    pub truncated: bool,
}

impl DriftReport {
    pub fn violations(&self) -> Vec<&DriftEntry> {
        self.entries.iter().filter(|e| !e.ignored).collect()
    }

    pub fn violation_paths(&self) -> Vec<String> {
        self.violations().iter().map(|e| e.path.to_string()).collect()
    }

    /// A truncated report is never clean
    pub fn is_clean(&self) -> bool {
        !self.truncated && self.violations().is_empty()
    }
}

/// Structural comparison of two JSON trees
#[derive(Clone, Debug)]
pub struct DriftDetector {
    policy: IgnorePolicy,
    max_depth: usize,
    max_diffs: usize,
}

impl Default for DriftDetector {
    fn default() -> Self {
        DriftDetector {
            policy: IgnorePolicy::default(),
            max_depth: 32,
            max_diffs: 100,
        }
    }
}

fn is_absent(v: Option<&Value>) -> bool {
    matches!(v, None | Some(Value::Null))
}

impl DriftDetector {
    #[must_use]
    pub fn new(policy: IgnorePolicy, max_depth: usize, max_diffs: usize) -> DriftDetector {
        DriftDetector {
            policy,
            max_depth,
            max_diffs,
        }
    }

    pub fn policy(&self) -> &IgnorePolicy {
        &self.policy
    }

    pub fn compare(&self, live: &Value, expected: &Value) -> DriftReport {
        let mut report = DriftReport::default();
        let mut path = Vec::new();
        self.walk(&mut path, Some(live), Some(expected), 0, &mut report);
        report
    }

    fn record(&self, path: &[Segment], live: Option<&Value>, expected: Option<&Value>, report: &mut DriftReport) {
        if report.entries.len() >= self.max_diffs {
            report.truncated = true;
            return;
        }
        let path = FieldPath(path.to_vec());
        let ignored = self.policy.is_ignored(&path);
        report.entries.push(DriftEntry {
            path,
            live: live.cloned(),
            expected: expected.cloned(),
            ignored,
        });
    }

    fn walk(
        &self,
        path: &mut Vec<Segment>,
        live: Option<&Value>,
        expected: Option<&Value>,
        depth: usize,
        report: &mut DriftReport,
    ) {
        if report.truncated {
            return;
        }
        if is_absent(live) && is_absent(expected) {
            return;
        }
        if live == expected {
            return;
        }
        if !path.is_empty() && self.policy.covers_subtree(&FieldPath(path.clone())) {
            self.record(path, live, expected, report);
            return;
        }
        match (live, expected) {
            (Some(Value::Object(l)), Some(Value::Object(e))) if depth < self.max_depth => {
                let mut keys: Vec<&String> = l.keys().chain(e.keys()).collect();
                keys.sort();
                keys.dedup();
                for k in keys {
                    path.push(Segment::Key(k.clone()));
                    self.walk(path, l.get(k), e.get(k), depth + 1, report);
                    path.pop();
                }
            }
            (Some(Value::Array(l)), Some(Value::Array(e))) if depth < self.max_depth => {
                for i in 0..l.len().max(e.len()) {
                    path.push(Segment::Index(i));
                    self.walk(path, l.get(i), e.get(i), depth + 1, report);
                    path.pop();
                }
            }
            (Some(Value::Object(_)), Some(Value::Object(_))) | (Some(Value::Array(_)), Some(Value::Array(_))) => {
                report.truncated = true;
                self.record(path, live, expected, report);
            }
            _ => self.record(path, live, expected, report),
        }
    }
}

/// RFC 7386 merge patch turning `from` into `to`
pub fn merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(f), Value::Object(t)) => {
            let mut patch = serde_json::Map::new();
            for k in f.keys() {
                if !t.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            for (k, v) in t {
                match f.get(k) {
                    Some(old) if old == v => {}
                    Some(old) if old.is_object() && v.is_object() => {
                        patch.insert(k.clone(), merge_patch(old, v));
                    }
                    _ => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

fn set_path(doc: &mut Value, path: &[Segment], value: Option<Value>) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *doc = value.unwrap_or(Value::Null);
        return Ok(());
    };
    let mut cur = doc;
    for seg in parents {
        cur = match seg {
            Segment::Key(k) => {
                if !cur.is_object() {
                    *cur = Value::Object(serde_json::Map::new());
                }
                cur.as_object_mut()
                    .ok_or_else(|| Error::Other(format!("cannot descend into {k}")))?
                    .entry(k.clone())
                    .or_insert(Value::Null)
            }
            Segment::Index(i) => cur
                .as_array_mut()
                .and_then(|a| a.get_mut(*i))
                .ok_or_else(|| Error::Other(format!("index {i} out of range")))?,
        };
    }
    match (last, value) {
        (Segment::Key(k), Some(v)) => {
            if !cur.is_object() {
                *cur = Value::Object(serde_json::Map::new());
            }
            if let Some(obj) = cur.as_object_mut() {
                obj.insert(k.clone(), v);
            }
        }
        (Segment::Key(k), None) => {
            if let Some(obj) = cur.as_object_mut() {
                obj.remove(k);
            }
        }
        (Segment::Index(i), v) => {
            let arr = cur
                .as_array_mut()
                .ok_or_else(|| Error::Other(format!("index {i} on a non array")))?;
            match v {
                Some(v) if *i < arr.len() => arr[*i] = v,
                Some(v) if *i == arr.len() => arr.push(v),
                None if *i < arr.len() => {
                    arr.remove(*i);
                }
                None => {}
                Some(_) => return Err(Error::Other(format!("index {i} out of range"))),
            }
        }
    }
    Ok(())
}

/// `live` with every violation of `report` set to its expected value.
/// Ignored entries keep their live value.
pub fn restore_target(live: &Value, report: &DriftReport) -> Result<Value> {
    let mut target = live.clone();
    let violations = report.violations();
    for entry in violations.iter().filter(|e| e.expected.is_some()) {
        set_path(&mut target, entry.path.segments(), entry.expected.clone())?;
    }
    for entry in violations.iter().rev().filter(|e| e.expected.is_none()) {
        set_path(&mut target, entry.path.segments(), None)?;
    }
    Ok(target)
}
