use crate::error::{BenchError, Result};
use crate::fs_util::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

pub type Tree = BTreeMap<String, NmlValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NmlValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
    Map(Tree),
}

impl From<bool> for NmlValue {
    fn from(v: bool) -> Self {
        NmlValue::Scalar(Scalar::Bool(v))
    }
}

impl From<i64> for NmlValue {
    fn from(v: i64) -> Self {
        NmlValue::Scalar(Scalar::Int(v))
    }
}

impl From<f64> for NmlValue {
    fn from(v: f64) -> Self {
        NmlValue::Scalar(Scalar::Real(v))
    }
}

impl From<&str> for NmlValue {
    fn from(v: &str) -> Self {
        NmlValue::Scalar(Scalar::Str(v.to_string()))
    }
}

impl From<String> for NmlValue {
    fn from(v: String) -> Self {
        NmlValue::Scalar(Scalar::Str(v))
    }
}

impl From<Tree> for NmlValue {
    fn from(v: Tree) -> Self {
        NmlValue::Map(v)
    }
}

impl Scalar {
    pub fn to_fortran(&self) -> String {
        match self {
            Scalar::Bool(true) => ".true.".to_string(),
            Scalar::Bool(false) => ".false.".to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Real(r) => format_real(*r),
            Scalar::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

// Always carries a '.' or an exponent so it reads back as a real.
fn format_real(r: f64) -> String {
    if !r.is_finite() {
        return r.to_string();
    }
    let magnitude = r.abs();
    if magnitude >= 1e16 || (magnitude != 0.0 && magnitude < 1e-4) {
        let text = format!("{:e}", r);
        match text.split_once('e') {
            Some((mantissa, exp)) if !mantissa.contains('.') => format!("{}.0e{}", mantissa, exp),
            _ => text,
        }
    } else if r.fract() == 0.0 {
        format!("{:.1}", r)
    } else {
        r.to_string()
    }
}

pub fn normalize_keys(tree: &Tree) -> Tree {
    tree.iter()
        .map(|(k, v)| {
            let v = match v {
                NmlValue::Map(sub) => NmlValue::Map(normalize_keys(sub)),
                other => other.clone(),
            };
            (k.to_ascii_lowercase(), v)
        })
        .collect()
}

/// Deep-merges `overrides` into `target`. Maps merge key by key; any other
/// value replaces what was there.
pub fn merge(target: &mut Tree, overrides: &Tree) {
    for (key, value) in overrides {
        let key = key.to_ascii_lowercase();
        match (target.get_mut(&key), value) {
            (Some(NmlValue::Map(existing)), NmlValue::Map(sub)) => merge(existing, sub),
            (_, NmlValue::Map(sub)) => {
                target.insert(key, NmlValue::Map(normalize_keys(sub)));
            }
            (_, other) => {
                target.insert(key, other.clone());
            }
        }
    }
}

/// Deletes the key paths named by `keys`. A non-empty map in `keys` descends;
/// anything else deletes the key itself. Fails on the first absent path,
/// returning it in dotted form.
pub fn remove_keys(target: &mut Tree, keys: &Tree) -> std::result::Result<(), String> {
    remove_keys_at(target, keys, "")
}

fn remove_keys_at(target: &mut Tree, keys: &Tree, prefix: &str) -> std::result::Result<(), String> {
    for (key, value) in keys {
        let key = key.to_ascii_lowercase();
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            NmlValue::Map(sub) if !sub.is_empty() => match target.get_mut(&key) {
                Some(NmlValue::Map(existing)) => remove_keys_at(existing, sub, &dotted)?,
                _ => return Err(dotted),
            },
            _ => {
                if target.remove(&key).is_none() {
                    return Err(dotted);
                }
            }
        }
    }
    Ok(())
}

pub fn flatten(tree: &Tree) -> BTreeMap<String, NmlValue> {
    let mut out = BTreeMap::new();
    flatten_into(tree, "", &mut out);
    out
}

fn flatten_into(tree: &Tree, prefix: &str, out: &mut BTreeMap<String, NmlValue>) {
    for (key, value) in tree {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            NmlValue::Map(sub) => flatten_into(sub, &dotted, out),
            leaf => {
                out.insert(dotted, leaf.clone());
            }
        }
    }
}

pub fn read(path: &Path) -> Result<Tree> {
    let text = fs::read_to_string(path).map_err(|e| BenchError::io(path, e))?;
    parse(&text).map_err(|message| BenchError::Namelist {
        path: path.to_path_buf(),
        message,
    })
}

pub fn write(path: &Path, doc: &Tree) -> Result<()> {
    let text = render(doc).map_err(|message| BenchError::Namelist {
        path: path.to_path_buf(),
        message,
    })?;
    atomic_write_bytes(path, text.as_bytes())
}

fn read_or_empty(path: &Path) -> Result<Tree> {
    if path.exists() {
        read(path)
    } else {
        Ok(Tree::new())
    }
}

/// Merges `overrides` into the namelist file at `path`, creating it when
/// absent. An empty patch does not touch the filesystem.
pub fn patch(path: &Path, overrides: &Tree) -> Result<()> {
    if overrides.is_empty() {
        return Ok(());
    }
    let mut doc = read_or_empty(path)?;
    merge(&mut doc, overrides);
    write(path, &doc)
}

/// Removes key paths from the namelist file at `path`. The file is only
/// rewritten when every path exists.
pub fn remove(path: &Path, keys: &Tree) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let mut doc = read_or_empty(path)?;
    remove_keys(&mut doc, keys).map_err(|key| BenchError::MissingKey {
        key,
        path: path.to_path_buf(),
    })?;
    write(path, &doc)
}

pub fn render(doc: &Tree) -> std::result::Result<String, String> {
    let mut out = String::new();
    for (group, value) in doc {
        let entries = match value {
            NmlValue::Map(entries) => entries,
            _ => return Err(format!("top-level key '{}' is not a namelist group", group)),
        };
        let _ = writeln!(out, "&{}", group);
        render_entries(&mut out, group, "", entries)?;
        out.push_str("/\n\n");
    }
    Ok(out)
}

fn render_entries(
    out: &mut String,
    group: &str,
    prefix: &str,
    entries: &Tree,
) -> std::result::Result<(), String> {
    for (key, value) in entries {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}%{}", prefix, key)
        };
        let non_finite = match value {
            NmlValue::Scalar(s) => !is_finite(s),
            NmlValue::List(items) => !items.iter().all(is_finite),
            NmlValue::Map(_) => false,
        };
        if non_finite {
            return Err(format!("non-finite real for key '{}%{}'", group, name));
        }
        match value {
            NmlValue::Map(sub) => render_entries(out, group, &name, sub)?,
            NmlValue::Scalar(s) => {
                let _ = writeln!(out, "    {} = {}", name, s.to_fortran());
            }
            NmlValue::List(items) => {
                let joined = items
                    .iter()
                    .map(Scalar::to_fortran)
                    .collect::<Vec<_>>()
                    .join(", ");
                if joined.is_empty() {
                    // reads back as an empty list
                    let _ = writeln!(out, "    {} =", name);
                } else {
                    let _ = writeln!(out, "    {} = {}", name, joined);
                }
            }
        }
    }
    Ok(())
}

fn is_finite(s: &Scalar) -> bool {
    match s {
        Scalar::Real(r) => r.is_finite(),
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    GroupStart(String),
    GroupEnd,
    Equals,
    Comma,
    Quoted(String),
    Bare(String),
}

fn tokenize(text: &str) -> std::result::Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1usize;
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '!' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '&' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(format!("line {}: '&' without a group name", line));
                }
                if name.eq_ignore_ascii_case("end") {
                    toks.push(Tok::GroupEnd);
                } else {
                    toks.push(Tok::GroupStart(name.to_ascii_lowercase()));
                }
            }
            '/' => toks.push(Tok::GroupEnd),
            '=' => toks.push(Tok::Equals),
            ',' => toks.push(Tok::Comma),
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        if chars.peek() == Some(&quote) {
                            s.push(quote);
                            chars.next();
                        } else {
                            closed = true;
                            break;
                        }
                    } else {
                        if c == '\n' {
                            line += 1;
                        }
                        s.push(c);
                    }
                }
                if !closed {
                    return Err(format!("line {}: unterminated string", line));
                }
                toks.push(Tok::Quoted(s));
            }
            c => {
                let mut word = String::from(c);
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "=,/!'\"&".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                toks.push(Tok::Bare(word));
            }
        }
    }
    Ok(toks)
}

pub fn parse(text: &str) -> std::result::Result<Tree, String> {
    let toks = tokenize(text)?;
    let mut doc = Tree::new();
    let mut i = 0;
    while i < toks.len() {
        if let Tok::GroupStart(name) = &toks[i] {
            let (body, next) = parse_group_body(&toks, i + 1, name)?;
            match doc.get_mut(name) {
                Some(NmlValue::Map(existing)) => merge(existing, &body),
                _ => {
                    doc.insert(name.clone(), NmlValue::Map(body));
                }
            }
            i = next;
        } else {
            // Fortran skips anything between groups.
            i += 1;
        }
    }
    Ok(doc)
}

fn parse_group_body(
    toks: &[Tok],
    mut i: usize,
    group: &str,
) -> std::result::Result<(Tree, usize), String> {
    let mut body = Tree::new();
    let mut current: Option<(Vec<String>, Vec<Scalar>)> = None;
    let mut repeat: Option<usize> = None;
    loop {
        let tok = toks
            .get(i)
            .ok_or_else(|| format!("group &{} is not terminated with '/'", group))?;
        match tok {
            Tok::GroupEnd => {
                flush_entry(&mut body, current.take())?;
                return Ok((body, i + 1));
            }
            Tok::GroupStart(next) => {
                return Err(format!(
                    "group &{} starts before &{} is terminated",
                    next, group
                ));
            }
            Tok::Comma => i += 1,
            Tok::Equals => return Err(format!("unexpected '=' in group &{}", group)),
            Tok::Bare(word) if toks.get(i + 1) == Some(&Tok::Equals) => {
                flush_entry(&mut body, current.take())?;
                current = Some((parse_key(word)?, Vec::new()));
                repeat = None;
                i += 2;
            }
            Tok::Bare(word) | Tok::Quoted(word) => {
                let (_, values) = current
                    .as_mut()
                    .ok_or_else(|| format!("value '{}' without a key in group &{}", word, group))?;
                let is_bare = matches!(tok, Tok::Bare(_));
                match is_bare.then(|| split_repeat(word)).flatten() {
                    Some((n, "")) => repeat = Some(n),
                    Some((n, rest)) => values.extend(std::iter::repeat(parse_bare(rest)).take(n)),
                    None => {
                        let value = if is_bare {
                            parse_bare(word)
                        } else {
                            Scalar::Str(word.clone())
                        };
                        let n = repeat.take().unwrap_or(1);
                        values.extend(std::iter::repeat(value).take(n));
                    }
                }
                i += 1;
            }
        }
    }
}

fn flush_entry(
    body: &mut Tree,
    entry: Option<(Vec<String>, Vec<Scalar>)>,
) -> std::result::Result<(), String> {
    let Some((path, mut values)) = entry else {
        return Ok(());
    };
    let value = if values.len() == 1 {
        NmlValue::Scalar(values.remove(0))
    } else {
        NmlValue::List(values)
    };
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| "empty key".to_string())?;
    let mut cur = body;
    for part in parents {
        let entry = cur
            .entry(part.clone())
            .or_insert_with(|| NmlValue::Map(Tree::new()));
        cur = match entry {
            NmlValue::Map(sub) => sub,
            _ => return Err(format!("'{}' is both a value and a derived type", part)),
        };
    }
    cur.insert(last.clone(), value);
    Ok(())
}

fn parse_key(word: &str) -> std::result::Result<Vec<String>, String> {
    if word.contains('(') {
        return Err(format!("array-indexed key '{}' is not supported", word));
    }
    let parts: Vec<String> = word.split('%').map(|p| p.to_ascii_lowercase()).collect();
    let valid = parts.iter().all(|p| {
        !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if !valid {
        return Err(format!("invalid key '{}'", word));
    }
    Ok(parts)
}

fn split_repeat(word: &str) -> Option<(usize, &str)> {
    let (count, rest) = word.split_once('*')?;
    if count.is_empty() || !count.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    count.parse().ok().map(|n| (n, rest))
}

fn parse_bare(word: &str) -> Scalar {
    let lower = word.to_ascii_lowercase();
    match lower.as_str() {
        ".true." | ".t." | "t" => return Scalar::Bool(true),
        ".false." | ".f." | "f" => return Scalar::Bool(false),
        _ => {}
    }
    if let Ok(i) = lower.parse::<i64>() {
        return Scalar::Int(i);
    }
    let numeric_start = lower
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || "+-.".contains(c))
        .unwrap_or(false);
    if numeric_start {
        if let Ok(r) = lower.replace('d', "e").parse::<f64>() {
            return Scalar::Real(r);
        }
    }
    Scalar::Str(word.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;

    fn tree(json: serde_json::Value) -> Tree {
        serde_json::from_value(json).expect("tree")
    }

    const TEMPLATE: &str = "\
! CABLE offline driver settings
&cable
   filename%met = 'met.nc'   ! forcing
   filename%out = \"out.nc\"
   cable_user%GS_SWITCH = 'medlyn'
   spinup = .TRUE.
   fixedCO2 = 3.5d2
   ktau_gl = 10
   leaps = T
   vegparams = 1.0, 2.5,
               3*0.0
   label = 'it''s'
/
&casa
   icycle = 0
/
";

    #[test]
    fn parses_derived_types_comments_and_literals() {
        let doc = parse(TEMPLATE).expect("parse");
        let cable = match doc.get("cable") {
            Some(NmlValue::Map(m)) => m,
            other => panic!("unexpected {:?}", other),
        };
        let flat = flatten(&doc);
        assert_eq!(flat["cable.filename.met"], NmlValue::from("met.nc"));
        assert_eq!(flat["cable.filename.out"], NmlValue::from("out.nc"));
        assert_eq!(flat["cable.cable_user.gs_switch"], NmlValue::from("medlyn"));
        assert_eq!(cable["spinup"], NmlValue::from(true));
        assert_eq!(cable["fixedco2"], NmlValue::from(350.0));
        assert_eq!(cable["ktau_gl"], NmlValue::from(10));
        assert_eq!(cable["leaps"], NmlValue::from(true));
        assert_eq!(cable["label"], NmlValue::from("it's"));
        assert_eq!(
            cable["vegparams"],
            NmlValue::List(vec![
                Scalar::Real(1.0),
                Scalar::Real(2.5),
                Scalar::Real(0.0),
                Scalar::Real(0.0),
                Scalar::Real(0.0),
            ])
        );
        assert_eq!(flat["casa.icycle"], NmlValue::from(0));
    }

    #[test]
    fn rendered_document_reads_back_identically() {
        let doc = parse(TEMPLATE).expect("parse");
        let text = render(&doc).expect("render");
        assert!(text.contains("    filename%met = 'met.nc'\n"), "{}", text);
        assert!(text.contains("    fixedco2 = 350.0\n"), "{}", text);
        assert!(text.contains("    label = 'it''s'\n"), "{}", text);
        assert_eq!(parse(&text).expect("reparse"), doc);
    }

    #[test]
    fn large_and_tiny_reals_read_back_as_reals() {
        let doc = tree(serde_json::json!({"cable": {"big": 1e17, "tiny": 2.5e-7, "neg": -3e20}}));
        let text = render(&doc).expect("render");
        assert!(text.contains("    big = 1.0e17\n"), "{}", text);
        assert!(text.contains("    neg = -3.0e20\n"), "{}", text);
        assert_eq!(parse(&text).expect("reparse"), doc);
        assert_eq!(flatten(&doc)["cable.big"], NmlValue::from(1e17));
    }

    #[test]
    fn non_finite_reals_cannot_be_rendered() {
        let mut cable = Tree::new();
        cable.insert("x".to_string(), NmlValue::from(f64::NAN));
        let mut doc = Tree::new();
        doc.insert("cable".to_string(), NmlValue::Map(cable));
        let err = render(&doc).expect_err("nan");
        assert!(err.contains("cable%x"), "{}", err);

        let mut cable = Tree::new();
        cable.insert(
            "v".to_string(),
            NmlValue::List(vec![Scalar::Real(1.0), Scalar::Real(f64::INFINITY)]),
        );
        doc.insert("cable".to_string(), NmlValue::Map(cable));
        assert!(render(&doc).is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("&cable\n a = 1\n").is_err());
        assert!(parse("&cable\n a(1) = 1\n/\n").is_err());
        assert!(parse("&cable\n a = 'open\n/\n").is_err());
        assert!(parse("&cable\n 1, 2\n/\n").is_err());
    }

    #[test]
    fn merge_recurses_into_maps_and_replaces_leaves() {
        let mut doc = tree(serde_json::json!({
            "cable": {"filename": {"met": "a.nc", "out": "o.nc"}, "list": [1, 2, 3]}
        }));
        merge(
            &mut doc,
            &tree(serde_json::json!({
                "CABLE": {"FileName": {"met": "b.nc"}, "list": [9], "new": {"x": true}}
            })),
        );
        assert_eq!(
            doc,
            tree(serde_json::json!({
                "cable": {
                    "filename": {"met": "b.nc", "out": "o.nc"},
                    "list": [9],
                    "new": {"x": true}
                }
            }))
        );
    }

    #[test]
    fn remove_keys_reports_dotted_missing_path() {
        let mut doc = tree(serde_json::json!({"cable": {"a": 1, "b": {"c": 2}}}));
        remove_keys(&mut doc, &tree(serde_json::json!({"cable": {"b": {"c": 0}}})))
            .expect("present");
        assert_eq!(doc, tree(serde_json::json!({"cable": {"a": 1, "b": {}}})));
        let err = remove_keys(&mut doc, &tree(serde_json::json!({"cable": {"b": {"c": 0}}})))
            .expect_err("already gone");
        assert_eq!(err, "cable.b.c");
    }

    #[test]
    fn empty_patch_leaves_files_alone() {
        let root = temp_root("nml_empty_patch");
        let absent = root.join("absent.nml");
        patch(&absent, &Tree::new()).expect("no-op");
        assert!(!absent.exists());

        let present = root.join("present.nml");
        fs::write(&present, TEMPLATE).expect("write");
        patch(&present, &Tree::new()).expect("no-op");
        assert_eq!(fs::read_to_string(&present).expect("read"), TEMPLATE);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn patch_creates_missing_file_and_merges_existing() {
        let root = temp_root("nml_patch");
        let path = root.join("cable.nml");
        patch(&path, &tree(serde_json::json!({"cable": {"spinup": false}}))).expect("create");
        patch(&path, &tree(serde_json::json!({"cable": {"ktau": 5}}))).expect("merge");
        let doc = read(&path).expect("read");
        assert_eq!(
            doc,
            tree(serde_json::json!({"cable": {"spinup": false, "ktau": 5}}))
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_of_absent_key_fails_without_rewriting() {
        let root = temp_root("nml_remove");
        let path = root.join("cable.nml");
        fs::write(&path, "&a\n    c = 1\n/\n").expect("write");
        let err = remove(&path, &tree(serde_json::json!({"a": {"b": 1}}))).expect_err("missing");
        match err {
            BenchError::MissingKey { key, .. } => assert_eq!(key, "a.b"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), "&a\n    c = 1\n/\n");

        remove(&path, &tree(serde_json::json!({"a": {"c": 1}}))).expect("present");
        assert_eq!(read(&path).expect("read"), tree(serde_json::json!({"a": {}})));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn top_level_scalars_cannot_be_rendered() {
        let doc = tree(serde_json::json!({"loose": 1}));
        assert!(render(&doc).is_err());
    }
}
