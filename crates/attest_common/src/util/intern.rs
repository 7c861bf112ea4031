use std::collections::BTreeMap;

/// Mints solver-safe identifiers for the string keys of the input assembly.
///
/// Mangled names must be stable across the whole run (the body translator and
/// the type emitter both refer to the same generated functions), so a single
/// interner is threaded by reference into every component that needs one.
/// Minting is idempotent; looking a key up before it has been minted is a
/// construction fault at the caller, never a panic here.
#[derive(Clone, Debug)]
pub struct NameInterner {
    names: BTreeMap<(String, String), String>,
    taken: BTreeMap<String, usize>,
}

impl NameInterner {
    pub fn new() -> Self {
        NameInterner {
            names: BTreeMap::new(),
            taken: BTreeMap::new(),
        }
    }

    /// Returns the mangled name for `key` in `namespace`, minting it on first
    /// use. Distinct keys never collide: a numeric suffix disambiguates keys
    /// whose mangled forms would otherwise coincide.
    pub fn mint(&mut self, namespace: &str, key: &str) -> String {
        let map_key = (namespace.to_owned(), key.to_owned());
        if let Some(existing) = self.names.get(&map_key) {
            return existing.clone();
        }

        let base = format!("{}{}", namespace, mangle(key));
        let count = self.taken.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base
        } else {
            format!("{}${}", base, *count)
        };
        *count += 1;

        self.names.insert(map_key, name.clone());
        name
    }

    pub fn lookup(&self, namespace: &str, key: &str) -> Option<&str> {
        self.names
            .get(&(namespace.to_owned(), key.to_owned()))
            .map(|s| s.as_str())
    }
}

/// Rewrites a type or invocation key into an SMT-LIB-safe identifier chunk.
fn mangle(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '$' | '@' => out.push(c),
            ':' | '.' | '/' => out.push('-'),
            '<' | '(' | '[' | '{' => out.push('L'),
            '>' | ')' | ']' | '}' => out.push('R'),
            ',' | ' ' | '|' => out.push('_'),
            _ => out.push('~'),
        }
    }
    out
}
