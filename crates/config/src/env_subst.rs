//! `${VAR}` expansion over raw config text, before parsing.
//!
//! Supported forms, as in compose files deployed next to the swarm:
//! `${VAR}`, `${VAR:-fallback}` (fallback when unset or empty) and `$$` for a
//! literal dollar sign. Unset variables without a fallback are left in place
//! so the validator can point at them.

pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
            continue;
        }
        let Some(body) = tail.strip_prefix('{') else {
            out.push('$');
            rest = tail;
            continue;
        };
        let Some(end) = body.find('}') else {
            // Unclosed: copy the remainder verbatim.
            out.push_str(&rest[pos..]);
            return out;
        };

        let expr = &body[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        match (lookup(name).filter(|v| !v.is_empty() || fallback.is_none()), fallback) {
            (Some(value), _) if !name.is_empty() => out.push_str(&value),
            (None, Some(fallback)) if !name.is_empty() => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(expr);
                out.push('}');
            },
        }
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    out
}
