//! Strategy language: parsing and application

use super::request::{Request, MAX_HEAD_SIZE};
use super::{percent_decode, AlgenevaError};
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Part of the request a rule targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Method,
    Path,
    Version,
    /// Header, matched case-insensitively
    Header(String),
}

impl Field {
    fn is_request_line(&self) -> bool {
        !matches!(self, Field::Header(_))
    }
}

/// Half of a header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Name,
    Value,
}

/// Where `insert` places its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Start,
    End,
    Middle,
    Random,
}

/// A single mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Insert {
        value: String,
        location: Location,
        component: Component,
        count: usize,
    },
    Replace {
        value: String,
        component: Component,
        count: usize,
    },
    ChangeCase {
        upper: bool,
    },
    Duplicate,
}

/// Action tree: `duplicate` feeds its two copies to the left and right
/// subtrees, any other action feeds its result to the left subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub action: Action,
    pub left: Option<Box<Tree>>,
    pub right: Option<Box<Tree>>,
}

/// One `[HTTP:<field>:*]-<tree>-|` rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub field: Field,
    pub tree: Tree,
}

/// Parsed strategy: rules applied in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Strategy {
    rules: Vec<Rule>,
}

/// A field being mutated. Request-line fields only use `value`.
#[derive(Debug, Clone)]
struct Part {
    name: String,
    value: String,
}

impl Part {
    fn component_mut(&mut self, component: Component) -> &mut String {
        match component {
            Component::Name => &mut self.name,
            Component::Value => &mut self.value,
        }
    }
}

impl Strategy {
    /// Rules in application order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Mutate a request in place
    pub fn apply(&self, request: &mut Request) {
        for rule in &self.rules {
            rule.apply(request);
        }
    }
}

impl FromStr for Strategy {
    type Err = AlgenevaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rules = s
            .split_whitespace()
            .map(Rule::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if rules.is_empty() {
            return Err(AlgenevaError::InvalidStrategy("no rules".into()));
        }
        Ok(Self { rules })
    }
}

impl Rule {
    fn apply(&self, request: &mut Request) {
        let line_field = match &self.field {
            Field::Method => Some(&mut request.method),
            Field::Path => Some(&mut request.path),
            Field::Version => Some(&mut request.version),
            Field::Header(_) => None,
        };

        if let Some(target) = line_field {
            let part = Part {
                name: String::new(),
                value: std::mem::take(target),
            };
            // Duplicated request-line fields are written back to back
            *target = self.tree.apply(part).into_iter().map(|p| p.value).collect();
            return;
        }

        let Field::Header(wanted) = &self.field else {
            return;
        };
        let headers = std::mem::take(&mut request.headers);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(wanted) {
                let parts = self.tree.apply(Part { name, value });
                request
                    .headers
                    .extend(parts.into_iter().map(|p| (p.name, p.value)));
            } else {
                request.headers.push((name, value));
            }
        }
    }
}

impl FromStr for Rule {
    type Err = AlgenevaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AlgenevaError::InvalidStrategy(format!("{}: {}", reason, s));

        let rest = s.strip_prefix('[').ok_or_else(|| invalid("missing trigger"))?;
        let (trigger, rest) = rest.split_once(']').ok_or_else(|| invalid("unterminated trigger"))?;

        let mut fields = trigger.split(':');
        let (proto, name, wildcard) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(p), Some(n), Some(w), None) => (p, n, w),
            _ => return Err(invalid("trigger must be [HTTP:<field>:*]")),
        };
        if !proto.eq_ignore_ascii_case("HTTP") || wildcard != "*" || name.is_empty() {
            return Err(invalid("trigger must be [HTTP:<field>:*]"));
        }

        let field = match name.to_ascii_lowercase().as_str() {
            "method" => Field::Method,
            "path" => Field::Path,
            "version" => Field::Version,
            header => Field::Header(header.to_string()),
        };

        let body = rest
            .strip_prefix('-')
            .and_then(|r| r.strip_suffix("-|"))
            .ok_or_else(|| invalid("rule must read -<actions>-|"))?;

        let mut parser = TreeParser { input: body, pos: 0 };
        let tree = parser.tree()?.ok_or_else(|| invalid("empty action tree"))?;
        if parser.pos != body.len() {
            return Err(invalid("trailing characters"));
        }

        if field.is_request_line() && tree.uses_name() {
            return Err(invalid("request-line fields have no name component"));
        }

        Ok(Self { field, tree })
    }
}

impl Tree {
    fn apply(&self, part: Part) -> Vec<Part> {
        match &self.action {
            Action::Duplicate => {
                let mut out = Self::apply_child(&self.left, part.clone());
                out.extend(Self::apply_child(&self.right, part));
                out
            }
            action => Self::apply_child(&self.left, action.apply(part)),
        }
    }

    fn apply_child(child: &Option<Box<Tree>>, part: Part) -> Vec<Part> {
        match child {
            Some(tree) => tree.apply(part),
            None => vec![part],
        }
    }

    fn uses_name(&self) -> bool {
        let here = matches!(
            self.action,
            Action::Insert { component: Component::Name, .. }
                | Action::Replace { component: Component::Name, .. }
        );
        here || self.left.as_ref().is_some_and(|t| t.uses_name())
            || self.right.as_ref().is_some_and(|t| t.uses_name())
    }
}

impl Action {
    fn apply(&self, mut part: Part) -> Part {
        match self {
            Action::Insert {
                value,
                location,
                component,
                count,
            } => {
                let target = part.component_mut(*component);
                let at = location.offset(target);
                target.insert_str(at, &value.repeat(*count));
            }
            Action::Replace {
                value,
                component,
                count,
            } => {
                *part.component_mut(*component) = value.repeat(*count);
            }
            Action::ChangeCase { upper: true } => {
                part.name = part.name.to_uppercase();
                part.value = part.value.to_uppercase();
            }
            Action::ChangeCase { upper: false } => {
                part.name = part.name.to_lowercase();
                part.value = part.value.to_lowercase();
            }
            Action::Duplicate => {}
        }
        part
    }

    fn parse(name: &str, args: Option<&str>) -> Result<Self, AlgenevaError> {
        let invalid = |reason: &str| AlgenevaError::InvalidStrategy(format!("{}: {}", name, reason));
        let args: Vec<&str> = args.map(|a| a.split(':').collect()).unwrap_or_default();

        match (name, args.as_slice()) {
            ("insert", [value, location, component, count]) => {
                let value = percent_decode(value)?;
                Ok(Action::Insert {
                    location: location.parse()?,
                    component: component.parse()?,
                    count: parse_count(count, &value)?,
                    value,
                })
            }
            ("insert", _) => Err(invalid("expected {value:location:component:num}")),
            ("replace", [value, component, count]) => {
                let value = percent_decode(value)?;
                Ok(Action::Replace {
                    component: component.parse()?,
                    count: parse_count(count, &value)?,
                    value,
                })
            }
            ("replace", _) => Err(invalid("expected {value:component:num}")),
            ("changecase", ["upper"]) => Ok(Action::ChangeCase { upper: true }),
            ("changecase", ["lower"]) => Ok(Action::ChangeCase { upper: false }),
            ("changecase", _) => Err(invalid("expected {upper} or {lower}")),
            ("duplicate", []) => Ok(Action::Duplicate),
            ("duplicate", _) => Err(invalid("takes no arguments")),
            _ => Err(AlgenevaError::InvalidStrategy(format!("unknown action {}", name))),
        }
    }
}

/// Repeat count for `value`; the repeated run must fit in a request head
fn parse_count(s: &str, value: &str) -> Result<usize, AlgenevaError> {
    let count: usize = s
        .parse()
        .map_err(|_| AlgenevaError::InvalidStrategy(format!("invalid count {:?}", s)))?;
    match count.checked_mul(value.len().max(1)) {
        Some(len) if len <= MAX_HEAD_SIZE => Ok(count),
        _ => Err(AlgenevaError::InvalidStrategy(format!(
            "count {} of {:?} exceeds the {} byte head limit",
            count, value, MAX_HEAD_SIZE
        ))),
    }
}

impl Location {
    /// Byte offset in `s`, always on a char boundary
    fn offset(&self, s: &str) -> usize {
        let boundaries: Vec<usize> = s
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(s.len()))
            .collect();
        match self {
            Location::Start => 0,
            Location::End => s.len(),
            Location::Middle => boundaries[(boundaries.len() - 1) / 2],
            Location::Random => boundaries[rand::thread_rng().gen_range(0..boundaries.len())],
        }
    }
}

impl FromStr for Location {
    type Err = AlgenevaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Location::Start),
            "end" => Ok(Location::End),
            "middle" => Ok(Location::Middle),
            "random" => Ok(Location::Random),
            other => Err(AlgenevaError::InvalidStrategy(format!("unknown location {}", other))),
        }
    }
}

impl FromStr for Component {
    type Err = AlgenevaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Component::Name),
            "value" => Ok(Component::Value),
            other => Err(AlgenevaError::InvalidStrategy(format!("unknown component {}", other))),
        }
    }
}

/// Recursive-descent parser for `action{args}(left,right)`
struct TreeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TreeParser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<(), AlgenevaError> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(AlgenevaError::InvalidStrategy(format!(
                "expected '{}' at offset {} of {}",
                c, self.pos, self.input
            )))
        }
    }

    /// Parse a tree; `None` for an empty slot such as `(,x)`
    fn tree(&mut self) -> Result<Option<Tree>, AlgenevaError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Ok(None);
        }
        let name = &self.input[start..self.pos];

        let args = if self.peek() == Some('{') {
            let open = self.pos + 1;
            let close = self.input[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| AlgenevaError::InvalidStrategy(format!("unterminated {{ in {}", self.input)))?;
            self.pos = close + 1;
            Some(&self.input[open..close])
        } else {
            None
        };
        let action = Action::parse(name, args)?;

        let (left, right) = if self.peek() == Some('(') {
            self.expect('(')?;
            let left = self.tree()?;
            self.expect(',')?;
            let right = self.tree()?;
            self.expect(')')?;
            (left, right)
        } else {
            (None, None)
        };

        if right.is_some() && action != Action::Duplicate {
            return Err(AlgenevaError::InvalidStrategy(format!(
                "only duplicate takes a right branch: {}",
                self.input
            )));
        }

        Ok(Some(Tree {
            action,
            left: left.map(Box::new),
            right: right.map(Box::new),
        }))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Method => write!(f, "method"),
            Field::Path => write!(f, "path"),
            Field::Version => write!(f, "version"),
            Field::Header(name) => write!(f, "{}", name),
        }
    }
}
