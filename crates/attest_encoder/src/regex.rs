//! Translates validator patterns (a small regex subset) into the solver's
//! regular-expression terms.
//!
//! Supported: literal characters, `.`, postfix `*` `+` `?`, alternation `|`,
//! groups `(..)`, character classes `[a-z0-9_]` (no negation), the escapes
//! `\d` `\w` `\s`, and escaped metacharacters. Validators match the whole
//! string, so leading `^` and trailing `$` anchors are accepted and dropped.
//! Anything else is a construction fault, not a silent approximation.

use crate::error::EncodeError;

struct Parser<'a> {
    pattern: &'a str,
    chars: Vec<char>,
    pos: usize,
}

pub fn regex_to_smt(pattern: &str) -> Result<String, EncodeError> {
    let mut trimmed = pattern;
    if let Some(rest) = trimmed.strip_prefix('^') {
        trimmed = rest;
    }
    if let Some(rest) = trimmed.strip_suffix('$') {
        trimmed = rest;
    }

    let mut parser = Parser {
        pattern,
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    let term = parser.alternation()?;
    if parser.pos != parser.chars.len() {
        return Err(parser.fault("unbalanced group or stray metacharacter"));
    }
    Ok(term)
}

impl<'a> Parser<'a> {
    fn fault(&self, detail: &str) -> EncodeError {
        EncodeError::BadValidator {
            pattern: self.pattern.to_owned(),
            detail: detail.to_owned(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn alternation(&mut self) -> Result<String, EncodeError> {
        let mut arms = vec![self.concat()?];
        while self.peek() == Some('|') {
            self.bump();
            arms.push(self.concat()?);
        }
        Ok(if arms.len() == 1 {
            arms.pop().unwrap()
        } else {
            format!("(re.union {})", arms.join(" "))
        })
    }

    fn concat(&mut self) -> Result<String, EncodeError> {
        let mut parts = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            parts.push(self.postfix()?);
        }
        Ok(match parts.len() {
            0 => "(str.to_re \"\")".to_owned(),
            1 => parts.pop().unwrap(),
            _ => format!("(re.++ {})", parts.join(" ")),
        })
    }

    fn postfix(&mut self) -> Result<String, EncodeError> {
        let mut atom = self.atom()?;
        while let Some(c) = self.peek() {
            atom = match c {
                '*' => format!("(re.* {})", atom),
                '+' => format!("(re.+ {})", atom),
                '?' => format!("(re.opt {})", atom),
                _ => break,
            };
            self.bump();
        }
        Ok(atom)
    }

    fn atom(&mut self) -> Result<String, EncodeError> {
        match self.bump() {
            None => Err(self.fault("dangling operator")),
            Some('(') => {
                let inner = self.alternation()?;
                if self.bump() != Some(')') {
                    return Err(self.fault("unterminated group"));
                }
                Ok(inner)
            }
            Some('[') => self.char_class(),
            Some('.') => Ok("re.allchar".to_owned()),
            Some('\\') => self.escape(),
            Some(c) if "*+?)]{}".contains(c) => {
                Err(self.fault("metacharacter needs a preceding atom"))
            }
            Some(c) => Ok(literal(c)),
        }
    }

    fn escape(&mut self) -> Result<String, EncodeError> {
        match self.bump() {
            None => Err(self.fault("trailing backslash")),
            Some(c) => {
                if let Some(term) = class_escape(c) {
                    return Ok(term);
                }
                if "\\.*+?()[]{}|^$".contains(c) {
                    Ok(literal(c))
                } else {
                    Err(self.fault("unsupported escape"))
                }
            }
        }
    }

    fn char_class(&mut self) -> Result<String, EncodeError> {
        if self.peek() == Some('^') {
            return Err(self.fault("negated character class"));
        }
        let mut members = Vec::new();
        loop {
            let c = match self.bump() {
                None => return Err(self.fault("unterminated character class")),
                Some(']') => break,
                Some('\\') => match self.bump() {
                    None => return Err(self.fault("trailing backslash")),
                    Some(esc) => {
                        if let Some(term) = class_escape(esc) {
                            if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']')
                            {
                                return Err(self.fault("class escape cannot bound a range"));
                            }
                            members.push(term);
                            continue;
                        }
                        if !"\\.*+?()[]{}|^$-".contains(esc) {
                            return Err(self.fault("unsupported escape"));
                        }
                        esc
                    }
                },
                Some(c) => c,
            };
            if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.bump();
                let hi = match self.bump() {
                    None | Some(']') => return Err(self.fault("unterminated range")),
                    Some('\\') => match self.bump() {
                        None => return Err(self.fault("trailing backslash")),
                        Some(esc) if class_escape(esc).is_some() => {
                            return Err(self.fault("class escape cannot bound a range"))
                        }
                        Some(esc) => esc,
                    },
                    Some(hi) => hi,
                };
                members.push(format!(
                    "(re.range \"{}\" \"{}\")",
                    escape_str(c),
                    escape_str(hi)
                ));
            } else {
                members.push(literal(c));
            }
        }
        match members.len() {
            0 => Err(self.fault("empty character class")),
            1 => Ok(members.pop().unwrap()),
            _ => Ok(format!("(re.union {})", members.join(" "))),
        }
    }
}

/// `\d` / `\w` / `\s`, valid both as atoms and as character-class members.
/// The whitespace escape embeds a real tab character; SMT-LIB string literals
/// have no backslash escapes.
fn class_escape(c: char) -> Option<String> {
    match c {
        'd' => Some("(re.range \"0\" \"9\")".to_owned()),
        'w' => Some(
            "(re.union (re.range \"a\" \"z\") (re.range \"A\" \"Z\") \
             (re.range \"0\" \"9\") (str.to_re \"_\"))"
                .to_owned(),
        ),
        's' => Some("(re.union (str.to_re \" \") (str.to_re \"\t\"))".to_owned()),
        _ => None,
    }
}

fn literal(c: char) -> String {
    format!("(str.to_re \"{}\")", escape_str(c))
}

fn escape_str(c: char) -> String {
    match c {
        '"' => "\"\"".to_owned(),
        c => c.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literals_concatenate() {
        let term = regex_to_smt("ab").unwrap();
        assert_eq!(term, "(re.++ (str.to_re \"a\") (str.to_re \"b\"))");
    }

    #[test]
    fn postfix_operators_wrap_the_atom() {
        assert_eq!(regex_to_smt("a*").unwrap(), "(re.* (str.to_re \"a\"))");
        assert_eq!(regex_to_smt("a+").unwrap(), "(re.+ (str.to_re \"a\"))");
        assert_eq!(regex_to_smt("a?").unwrap(), "(re.opt (str.to_re \"a\"))");
    }

    #[test]
    fn classes_become_ranges_and_unions() {
        let term = regex_to_smt("[a-z0-9_]").unwrap();
        assert_eq!(
            term,
            "(re.union (re.range \"a\" \"z\") (re.range \"0\" \"9\") (str.to_re \"_\"))"
        );
    }

    #[test]
    fn alternation_and_groups_nest() {
        let term = regex_to_smt("(ab|c)+").unwrap();
        assert_eq!(
            term,
            "(re.+ (re.union (re.++ (str.to_re \"a\") (str.to_re \"b\")) (str.to_re \"c\")))"
        );
    }

    #[test]
    fn class_escapes_expand_inside_classes() {
        assert_eq!(regex_to_smt(r"[\d]").unwrap(), "(re.range \"0\" \"9\")");
        assert_eq!(
            regex_to_smt(r"[\d_]").unwrap(),
            "(re.union (re.range \"0\" \"9\") (str.to_re \"_\"))"
        );
        assert!(matches!(
            regex_to_smt(r"[\d-5]"),
            Err(EncodeError::BadValidator { .. })
        ));
        assert!(matches!(
            regex_to_smt(r"[a-\d]"),
            Err(EncodeError::BadValidator { .. })
        ));
    }

    #[test]
    fn whitespace_escape_emits_a_real_tab() {
        let term = regex_to_smt(r"\s").unwrap();
        assert!(term.contains('\t'));
        assert!(!term.contains("\\t"));
    }

    #[test]
    fn anchors_are_dropped() {
        assert_eq!(regex_to_smt("^a$").unwrap(), regex_to_smt("a").unwrap());
    }

    #[test]
    fn unsupported_forms_are_construction_faults() {
        assert!(matches!(
            regex_to_smt("[^a]"),
            Err(EncodeError::BadValidator { .. })
        ));
        assert!(matches!(
            regex_to_smt("a{2,3}"),
            Err(EncodeError::BadValidator { .. })
        ));
        assert!(matches!(
            regex_to_smt("(a"),
            Err(EncodeError::BadValidator { .. })
        ));
    }
}
