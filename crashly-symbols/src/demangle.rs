//! Best-effort symbol name normalization.
//!
//! This is deliberately approximate: real demangling is delegated to the
//! demangler crates, and the rest is an ordered list of pattern rules plus
//! cosmetic rewrites that keep names readable and stable for grouping. It
//! is not a formal demangler.

use msvc_demangler::DemangleFlags;

fn msvc_flags() -> DemangleFlags {
    DemangleFlags::NO_ACCESS_SPECIFIERS
        | DemangleFlags::NO_FUNCTION_RETURNS
        | DemangleFlags::NO_MEMBER_TYPE
        | DemangleFlags::NO_MS_KEYWORDS
        | DemangleFlags::NO_THISTYPE
        | DemangleFlags::NO_CLASS_TYPE
        | DemangleFlags::SPACE_AFTER_COMMA
        | DemangleFlags::HUG_TYPE
}

/// Turns a raw symbol name into the readable form used for display.
///
/// Idempotent: normalized names pass through unchanged.
pub fn normalize(name: &str) -> String {
    let mut name = if name.starts_with('?') {
        msvc_demangler::demangle(name, msvc_flags()).unwrap_or_else(|_| name.to_string())
    } else if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        format!("{demangled:#}")
    } else if name.starts_with("_Z") || name.starts_with("__Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        match cpp_demangle::Symbol::new(name) {
            Ok(symbol) => symbol
                .demangle_with_options(&options)
                .unwrap_or_else(|_| name.to_string()),
            Err(_) => name.to_string(),
        }
    } else {
        name.to_string()
    };

    if name.starts_with('?') || name.starts_with('_') {
        if let Some(rewritten) = fallback_rule(&name) {
            name = rewritten;
        }
    }

    cosmetic(&name)
}

/// Strips template and argument lists so that overloads and instantiations
/// of one function coalesce: `Foo<Bar>(int, float)` becomes `Foo<>`.
///
/// Only used for triage keys and ignore-set matching, never for display.
pub fn reduce_for_signature(name: &str) -> String {
    let mut name = name.to_string();
    while let Some((start, end)) = find_pair(&name, b'(', b')', true) {
        let bytes = name.as_bytes();
        let mut after = end + 1;
        while after < bytes.len() && bytes[after] == b' ' {
            after += 1;
        }
        if name[after..].starts_with("const") {
            after += "const".len();
        }
        name.replace_range(start..after, "");
    }
    // Innermost-out, with a placeholder so collapsed pairs can merge into
    // their enclosing template list.
    while let Some((start, end)) = find_pair(&name, b'<', b'>', false) {
        name.replace_range(start..=end, "{}");
    }
    name = name.replace("{}", "<>");
    while let Some((start, end)) = find_pair(&name, b'[', b']', false) {
        name.replace_range(start..=end, "");
    }
    name.trim().to_string()
}

/// Ordered fallback rules for MSVC-mangled names the demangler rejected
/// (usually truncated dump entries). First match wins; no match passes the
/// name through untouched.
fn fallback_rule(name: &str) -> Option<String> {
    template_method(name)
        .or_else(|| class_method(name))
        .or_else(|| free_function(name))
        .or_else(|| std_method_template(name))
        .or_else(|| launch_pad(name))
        .or_else(|| stdcall_alias(name))
}

// ?method@?$Class@UTemplate@ -> Class<Template>::method
fn template_method(name: &str) -> Option<String> {
    let rest = name.strip_prefix('?')?;
    let (method, rest) = take_ident(rest)?;
    let rest = rest.strip_prefix("@?$")?;
    let (class, rest) = take_ident(rest)?;
    let rest = rest.strip_prefix("@U")?;
    let (template, rest) = take_ident(rest)?;
    rest.strip_prefix('@')?;
    Some(format!("{class}<{template}>::{method}"))
}

// ?method@Class@@ -> Class::method
fn class_method(name: &str) -> Option<String> {
    let rest = name.strip_prefix('?')?;
    let (method, rest) = take_ident(rest)?;
    let rest = rest.strip_prefix('@')?;
    let (class, rest) = take_ident(rest)?;
    rest.strip_prefix("@@")?;
    Some(format!("{class}::{method}"))
}

// ?function@@ -> function
fn free_function(name: &str) -> Option<String> {
    let rest = name.strip_prefix('?')?;
    let (function, rest) = take_ident(rest)?;
    rest.strip_prefix("@@")?;
    Some(function.to_string())
}

// ??$method@...@Class@std@@ -> std::Class::method
fn std_method_template(name: &str) -> Option<String> {
    let rest = name.strip_prefix("??$")?;
    let (method, rest) = take_ident(rest)?;
    let rest = rest.strip_prefix('@')?;
    let mut search_end = rest.len();
    while let Some(marker) = rest[..search_end].rfind("@std@@") {
        let before = &rest[..marker];
        if let Some(class) = trailing_ident(before) {
            let class_start = before.len() - class.len();
            if class_start > 0 && before.as_bytes()[class_start - 1] == b'@' {
                return Some(format!("std::{class}::{method}"));
            }
        }
        search_end = marker;
    }
    None
}

fn launch_pad(name: &str) -> Option<String> {
    name.strip_prefix("?_Go@?$_LaunchPad")
        .map(|_| "LaunchPad".to_string())
}

// _function@16 -> function (stdcall-decorated export)
fn stdcall_alias(name: &str) -> Option<String> {
    let rest = name.strip_prefix('_')?;
    let (function, rest) = take_ident(rest)?;
    rest.strip_prefix('@')?;
    Some(function.to_string())
}

fn cosmetic(name: &str) -> String {
    let mut name = name.to_string();
    loop {
        let next = unwrap_repeated_name(&name);
        if next == name {
            break;
        }
        name = next;
    }
    for token in [
        "__cdecl",
        "__thiscall",
        "public:",
        "private:",
        "protected:",
        "struct ",
        "class ",
    ] {
        name = remove_token(&name, token);
    }
    name.replace("glm::detail::tvec2<float,0>", "float2")
        .replace("glm::detail::tvec2<float, (glm::precision)0>", "float2")
        .replace(
            "std::basic_string<char,std::char_traits<char>,std::allocator<char> >",
            "string",
        )
        .replace(
            "std::basic_string<char, std::char_traits<char>, std::allocator<char> >",
            "string",
        )
        .replace("unsigned int", "uint")
        .replace("(void)", "()")
}

// Dia2Dump line dumps occasionally print a symbol as `sym(... sym ...)`;
// the parenthesized form is the complete one.
fn unwrap_repeated_name(name: &str) -> String {
    if let Some(open) = name.find('(') {
        if name.ends_with(')') && open > 0 && open < name.len() - 1 {
            let prefix = &name[..open];
            let inner = &name[open + 1..name.len() - 1];
            if prefix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b':')
                && inner.contains(prefix)
            {
                return inner.to_string();
            }
        }
    }
    name.to_string()
}

fn remove_token(name: &str, token: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(i) = rest.find(token) {
        out.push_str(&rest[..i]);
        rest = rest[i + token.len()..].trim_start_matches(' ');
    }
    out.push_str(rest);
    out
}

fn take_ident(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    if end == 0 {
        None
    } else {
        Some((&s[..end], &s[end..]))
    }
}

fn trailing_ident(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let mut start = s.len();
    while start > 0 && (bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_') {
        start -= 1;
    }
    if start == s.len() {
        None
    } else {
        Some(&s[start..])
    }
}

/// Leftmost innermost `open…close` pair whose content contains neither
/// delimiter. With `allow_empty` false, zero-length content is skipped.
fn find_pair(s: &str, open: u8, close: u8, allow_empty: bool) -> Option<(usize, usize)> {
    let mut open_pos = None;
    for (i, &b) in s.as_bytes().iter().enumerate() {
        if b == open {
            open_pos = Some(i);
        } else if b == close {
            if let Some(o) = open_pos.take() {
                if allow_empty || i > o + 1 {
                    return Some((o, i));
                }
            }
        }
    }
    None
}
