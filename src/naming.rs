// Path rendering and identifier handling for the three naming
// conventions the backends speak.
//
// Verilog-flavored interfaces spell hierarchical paths with dots and
// bracketed indices (top.u_core.bus[3]); VHDL-flavored ones use colons
// and parentheses (:top:u_core:bus(3)); the ModelSim native interface
// uses slashes (/top/u_core/bus(3)). Each backend normalizes incoming
// names and presents one stable external form, so the rest of the core
// never needs to care which simulator it is talking to.

use std::borrow::Cow;

use regex::Regex;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Convention {
    // a.b[0]
    DotBracket,
    // :a:b(0)
    ColonParen,
    // /a/b(0)
    Slash,
}


#[derive(Clone, Debug, PartialEq)]
pub enum Component {
    Name(String),
    Index(i64),
}


impl Convention {
    pub fn separator(&self) -> char {
        match self {
            Convention::DotBracket => '.',
            Convention::ColonParen => ':',
            Convention::Slash => '/',
        }
    }

    // Render "parent-path + child-name" in this convention. Roots have
    // no parent; colon and slash conventions carry a leading separator.
    pub fn join(&self, parent: Option<&str>, child: &str) -> String {
        match (self, parent) {
            (Convention::DotBracket, None) => child.to_string(),
            (Convention::DotBracket, Some(p)) => format!("{}.{}", p, child),
            (Convention::ColonParen, None) => format!(":{}", child),
            (Convention::ColonParen, Some(p)) => format!("{}:{}", p, child),
            (Convention::Slash, None) => format!("/{}", child),
            (Convention::Slash, Some(p)) => format!("{}/{}", p, child),
        }
    }

    pub fn index(&self, parent: &str, i: i64) -> String {
        match self {
            Convention::DotBracket => format!("{}[{}]", parent, i),
            _ => format!("{}({})", parent, i),
        }
    }

    // Split a path into name and index components. Escaped identifiers
    // pass through whole: a backslash suspends separator handling until
    // the escape closes (a trailing backslash for VHDL extended
    // identifiers, whitespace for Verilog escaped identifiers).
    pub fn split(&self, path: &str) -> Vec<Component> {
        let sep = self.separator();
        let mut out = Vec::new();
        let mut cur = String::new();
        let mut escaped = false;
        for c in path.chars() {
            if escaped {
                cur.push(c);
                if c == '\\' || (c.is_whitespace() && *self == Convention::DotBracket) {
                    escaped = false;
                }
            } else if c == '\\' {
                cur.push(c);
                escaped = true;
            } else if c == sep {
                push_component(&mut out, &mut cur);
            } else {
                cur.push(c);
            }
        }
        push_component(&mut out, &mut cur);
        out
    }
}


fn push_component(out: &mut Vec<Component>, cur: &mut String) {
    if cur.is_empty() {
        return;
    }
    lazy_static! {
        static ref INDEXED: Regex =
            Regex::new(r"^(.*?)[\[\(](-?\d+)[\]\)]$").unwrap();
    }
    let text = std::mem::replace(cur, String::new());
    let parsed = INDEXED.captures(&text).and_then(|caps| {
        let index: i64 = caps.get(2).unwrap().as_str().parse().ok()?;
        Some((caps.get(1).unwrap().as_str().to_string(), index))
    });
    match parsed {
        Some((name, index)) => {
            if !name.is_empty() {
                out.push(Component::Name(name));
            }
            out.push(Component::Index(index));
        }
        // Either no index suffix, or one too outlandish to be a
        // number; keep the text whole.
        None => out.push(Component::Name(text)),
    }
}


// True for names that need no escaping in either HDL.
fn is_basic_identifier(name: &str) -> bool {
    lazy_static! {
        static ref BASIC: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap();
    }
    BASIC.is_match(name)
}

// Wrap a name in VHDL extended-identifier escapes when it needs them.
// Embedded backslashes double, per the LRM rule.
pub fn escape_vhdl(name: &str) -> Cow<str> {
    if is_basic_identifier(name) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("\\{}\\", name.replace('\\', "\\\\")))
    }
}

// Verilog escaped identifiers start with a backslash and end at
// whitespace; the trailing space is part of the escape.
pub fn escape_verilog(name: &str) -> Cow<str> {
    if is_basic_identifier(name) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("\\{} ", name))
    }
}

// Undo either escape form, returning the bare name.
pub fn unescape(name: &str) -> Cow<str> {
    let n = name.trim_end();
    if n.len() >= 2 && n.starts_with('\\') && n.ends_with('\\') {
        Cow::Owned(n[1..n.len() - 1].replace("\\\\", "\\"))
    } else if let Some(stripped) = n.strip_prefix('\\') {
        Cow::Owned(stripped.to_string())
    } else {
        Cow::Borrowed(name)
    }
}
