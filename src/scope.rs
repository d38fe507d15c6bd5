use crate::record::{Attr, Value};
use serde_json::{Map, Value as Json};
use std::fmt;
use std::sync::Arc;

type ReplaceAttrFn = dyn Fn(&[String], Attr) -> Option<Attr> + Send + Sync;

/// Rewrites each non-group attribute before it is encoded.
///
/// The function receives the names of the groups enclosing the attribute and
/// the attribute itself. Returning `None` drops the attribute. The built-in
/// `time`, `level`, `msg` and `source` attributes are passed with no groups.
#[derive(Clone)]
pub struct ReplaceAttr(Arc<ReplaceAttrFn>);

impl ReplaceAttr {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[String], Attr) -> Option<Attr> + Send + Sync + 'static,
    {
        ReplaceAttr(Arc::new(f))
    }

    pub fn apply(&self, groups: &[String], attr: Attr) -> Option<Attr> {
        (self.0)(groups, attr)
    }
}

impl fmt::Debug for ReplaceAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplaceAttr(..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Attrs(Vec<Attr>),
    Group(String),
}

/// Attributes and groups a sink has accumulated through `with_attrs` and
/// `with_group`.
///
/// Extending a scope returns a new scope; the receiver is never modified, so
/// sinks derived from a common base can extend concurrently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrScope {
    segments: Vec<Segment>,
}

impl AttrScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attrs(&self, attrs: Vec<Attr>) -> Self {
        let mut scope = self.clone();
        if !attrs.is_empty() {
            scope.segments.push(Segment::Attrs(attrs));
        }
        scope
    }

    pub fn with_group(&self, name: &str) -> Self {
        let mut scope = self.clone();
        if !name.is_empty() {
            scope.segments.push(Segment::Group(name.to_string()));
        }
        scope
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Names of the open groups, outermost first.
    pub fn groups(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Group(name) => Some(name.as_str()),
                Segment::Attrs(_) => None,
            })
            .collect()
    }

    /// Renders the scope followed by `record_attrs` (which land in the
    /// innermost group) into `out`. Groups that end up empty are omitted.
    pub fn render_into(
        &self,
        out: &mut Map<String, Json>,
        record_attrs: &[Attr],
        replace: Option<&ReplaceAttr>,
    ) {
        let mut path = Vec::new();
        render_segments(out, &self.segments, record_attrs, replace, &mut path);
    }
}

fn render_segments(
    out: &mut Map<String, Json>,
    segments: &[Segment],
    record_attrs: &[Attr],
    replace: Option<&ReplaceAttr>,
    path: &mut Vec<String>,
) {
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Attrs(attrs) => insert_attrs(out, attrs, replace, path),
            Segment::Group(name) => {
                let mut inner = Map::new();
                path.push(name.clone());
                render_segments(&mut inner, &segments[i + 1..], record_attrs, replace, path);
                path.pop();
                if !inner.is_empty() {
                    out.insert(name.clone(), Json::Object(inner));
                }
                return;
            }
        }
    }
    insert_attrs(out, record_attrs, replace, path);
}

/// Inserts attributes into `out`, applying `replace` to leaves. A group with
/// an empty key is inlined into the enclosing object.
pub(crate) fn insert_attrs(
    out: &mut Map<String, Json>,
    attrs: &[Attr],
    replace: Option<&ReplaceAttr>,
    path: &mut Vec<String>,
) {
    for attr in attrs {
        if let Value::Group(members) = &attr.value {
            if attr.key.is_empty() {
                insert_attrs(out, members, replace, path);
                continue;
            }
            let mut inner = Map::new();
            path.push(attr.key.clone());
            insert_attrs(&mut inner, members, replace, path);
            path.pop();
            if !inner.is_empty() {
                out.insert(attr.key.clone(), Json::Object(inner));
            }
            continue;
        }

        let attr = match replace {
            Some(replace) => match replace.apply(path, attr.clone()) {
                Some(attr) => attr,
                None => continue,
            },
            None => attr.clone(),
        };
        if attr.key.is_empty() {
            continue;
        }
        out.insert(attr.key, attr.value.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn render(scope: &AttrScope, attrs: &[Attr], replace: Option<&ReplaceAttr>) -> Json {
        let mut out = Map::new();
        scope.render_into(&mut out, attrs, replace);
        Json::Object(out)
    }

    #[test]
    fn attrs_land_at_the_group_depth_they_were_added() {
        let scope = AttrScope::new()
            .with_attrs(vec![Attr::new("service", "api")])
            .with_group("req")
            .with_attrs(vec![Attr::new("id", 9)])
            .with_group("db");

        let out = render(&scope, &[Attr::new("rows", 3)], None);
        assert_eq!(
            out,
            json!({"service": "api", "req": {"id": 9, "db": {"rows": 3}}})
        );
        assert_eq!(scope.groups(), vec!["req", "db"]);
    }

    #[test]
    fn empty_groups_are_dropped() {
        let scope = AttrScope::new().with_group("outer").with_group("inner");
        assert_eq!(render(&scope, &[], None), json!({}));
    }

    #[test]
    fn extension_does_not_touch_the_receiver() {
        let base = AttrScope::new().with_attrs(vec![Attr::new("a", 1)]);
        let left = base.with_attrs(vec![Attr::new("b", 2)]);
        let right = base.with_group("g");
        assert_eq!(render(&base, &[], None), json!({"a": 1}));
        assert_eq!(render(&left, &[], None), json!({"a": 1, "b": 2}));
        assert_eq!(render(&right, &[Attr::new("c", 3)], None), json!({"a": 1, "g": {"c": 3}}));
        assert!(base.with_group("").with_attrs(vec![]) == base);
    }

    #[test]
    fn replace_sees_group_path_and_can_drop() {
        let replace = ReplaceAttr::new(|groups, attr| {
            if attr.key == "password" {
                return None;
            }
            if groups == ["http"] {
                return Some(Attr::new(attr.key.to_uppercase(), attr.value));
            }
            Some(attr)
        });
        let scope = AttrScope::new().with_group("http");
        let out = render(
            &scope,
            &[Attr::new("method", "GET"), Attr::new("password", "x")],
            Some(&replace),
        );
        assert_eq!(out, json!({"http": {"METHOD": "GET"}}));
    }

    #[test]
    fn empty_key_groups_are_inlined() {
        let out = render(
            &AttrScope::new(),
            &[Attr::group("", vec![Attr::new("x", 1)])],
            None,
        );
        assert_eq!(out, json!({"x": 1}));
    }
}
