use std::collections::BTreeSet;
use std::fmt;

/// A solver sort: the rendered SMT text plus an identifier-safe tag used when
/// composing derived names (result wrappers, havoc functions, witnesses).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SmtSort {
    pub name: String,
    pub tag: String,
}

impl SmtSort {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        SmtSort {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Datatype sorts where the rendered name is already identifier-safe.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        SmtSort {
            tag: name.clone(),
            name,
        }
    }
}

impl fmt::Display for SmtSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchBranch {
    pub ctor: String,
    pub binders: Vec<String>,
    pub body: SmtExp,
}

/// The closed constraint-expression algebra. Trees are built bottom-up and
/// never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SmtExp {
    Const(String),
    Var(String),
    /// A call whose callee cannot fail.
    CallSimple {
        fname: String,
        args: Vec<SmtExp>,
    },
    /// A call whose callee returns a failure sum the caller must inspect.
    CallGeneral {
        fname: String,
        args: Vec<SmtExp>,
    },
    /// A failure-sum call that additionally threads an optional-argument mask.
    CallMasked {
        fname: String,
        args: Vec<SmtExp>,
        mask: Box<SmtExp>,
    },
    Let {
        vname: String,
        value: Box<SmtExp>,
        body: Box<SmtExp>,
    },
    LetMulti {
        bindings: Vec<(String, SmtExp)>,
        body: Box<SmtExp>,
    },
    If {
        cond: Box<SmtExp>,
        tval: Box<SmtExp>,
        fval: Box<SmtExp>,
    },
    /// Multi-way conditional; lowers to nested binary `ite` at render time.
    Cond {
        branches: Vec<(SmtExp, SmtExp)>,
        default: Box<SmtExp>,
    },
    /// Algebraic-pattern dispatch; lowers to the solver's native `match`.
    Match {
        scrutinee: Box<SmtExp>,
        branches: Vec<MatchBranch>,
    },
    Forall {
        bindings: Vec<(String, SmtSort)>,
        body: Box<SmtExp>,
    },
    Exists {
        bindings: Vec<(String, SmtSort)>,
        body: Box<SmtExp>,
    },
    /// Constructs a boolean-vector mask value from its bits.
    MaskConstruct {
        ctor: String,
        bits: Vec<SmtExp>,
    },
}

impl SmtExp {
    pub fn bool_const(value: bool) -> SmtExp {
        SmtExp::Const(if value { "true" } else { "false" }.to_owned())
    }

    pub fn call(fname: impl Into<String>, args: Vec<SmtExp>) -> SmtExp {
        SmtExp::CallSimple {
            fname: fname.into(),
            args,
        }
    }

    pub fn ite(cond: SmtExp, tval: SmtExp, fval: SmtExp) -> SmtExp {
        SmtExp::If {
            cond: Box::new(cond),
            tval: Box::new(tval),
            fval: Box::new(fval),
        }
    }

    pub fn let_in(vname: impl Into<String>, value: SmtExp, body: SmtExp) -> SmtExp {
        SmtExp::Let {
            vname: vname.into(),
            value: Box::new(value),
            body: Box::new(body),
        }
    }

    pub fn and(args: Vec<SmtExp>) -> SmtExp {
        match args.len() {
            0 => SmtExp::bool_const(true),
            1 => args.into_iter().next().unwrap(),
            _ => SmtExp::call("and", args),
        }
    }

    pub fn or(args: Vec<SmtExp>) -> SmtExp {
        match args.len() {
            0 => SmtExp::bool_const(false),
            1 => args.into_iter().next().unwrap(),
            _ => SmtExp::call("or", args),
        }
    }

    pub fn not(arg: SmtExp) -> SmtExp {
        SmtExp::call("not", vec![arg])
    }

    pub fn eq(lhs: SmtExp, rhs: SmtExp) -> SmtExp {
        SmtExp::call("=", vec![lhs, rhs])
    }

    /// Names of every generated function this expression calls, used to build
    /// the secondary call graph over emitted definitions (the translator may
    /// synthesize helpers absent from the MIR).
    pub fn collect_callee_names(&self, into: &mut BTreeSet<String>) {
        match self {
            SmtExp::Const(_) | SmtExp::Var(_) => {}
            SmtExp::CallSimple { fname, args }
            | SmtExp::CallGeneral { fname, args } => {
                into.insert(fname.clone());
                for arg in args {
                    arg.collect_callee_names(into);
                }
            }
            SmtExp::CallMasked { fname, args, mask } => {
                into.insert(fname.clone());
                for arg in args {
                    arg.collect_callee_names(into);
                }
                mask.collect_callee_names(into);
            }
            SmtExp::Let { value, body, .. } => {
                value.collect_callee_names(into);
                body.collect_callee_names(into);
            }
            SmtExp::LetMulti { bindings, body } => {
                for (_, value) in bindings {
                    value.collect_callee_names(into);
                }
                body.collect_callee_names(into);
            }
            SmtExp::If { cond, tval, fval } => {
                cond.collect_callee_names(into);
                tval.collect_callee_names(into);
                fval.collect_callee_names(into);
            }
            SmtExp::Cond { branches, default } => {
                for (test, value) in branches {
                    test.collect_callee_names(into);
                    value.collect_callee_names(into);
                }
                default.collect_callee_names(into);
            }
            SmtExp::Match {
                scrutinee,
                branches,
            } => {
                scrutinee.collect_callee_names(into);
                for branch in branches {
                    branch.body.collect_callee_names(into);
                }
            }
            SmtExp::Forall { body, .. } | SmtExp::Exists { body, .. } => {
                body.collect_callee_names(into);
            }
            SmtExp::MaskConstruct { ctor, bits } => {
                into.insert(ctor.clone());
                for bit in bits {
                    bit.collect_callee_names(into);
                }
            }
        }
    }

    pub fn render(&self, indent: usize) -> String {
        let mut out = String::new();
        self.render_into(&mut out, indent);
        out
    }

    fn render_into(&self, out: &mut String, indent: usize) {
        let pad = |out: &mut String, depth: usize| {
            out.push('\n');
            for _ in 0..depth {
                out.push(' ');
            }
        };

        match self {
            SmtExp::Const(text) => out.push_str(text),
            SmtExp::Var(name) => out.push_str(name),

            SmtExp::CallSimple { fname, args } | SmtExp::CallGeneral { fname, args } => {
                if args.is_empty() {
                    out.push_str(fname);
                } else {
                    out.push('(');
                    out.push_str(fname);
                    for arg in args {
                        out.push(' ');
                        arg.render_into(out, indent);
                    }
                    out.push(')');
                }
            }

            SmtExp::CallMasked { fname, args, mask } => {
                out.push('(');
                out.push_str(fname);
                for arg in args {
                    out.push(' ');
                    arg.render_into(out, indent);
                }
                out.push(' ');
                mask.render_into(out, indent);
                out.push(')');
            }

            SmtExp::Let { vname, value, body } => {
                out.push_str("(let ((");
                out.push_str(vname);
                out.push(' ');
                value.render_into(out, indent);
                out.push_str("))");
                pad(out, indent + 2);
                body.render_into(out, indent + 2);
                out.push(')');
            }

            SmtExp::LetMulti { bindings, body } => {
                out.push_str("(let (");
                for (i, (vname, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push('(');
                    out.push_str(vname);
                    out.push(' ');
                    value.render_into(out, indent);
                    out.push(')');
                }
                out.push(')');
                pad(out, indent + 2);
                body.render_into(out, indent + 2);
                out.push(')');
            }

            SmtExp::If { cond, tval, fval } => {
                out.push_str("(ite ");
                cond.render_into(out, indent);
                pad(out, indent + 2);
                tval.render_into(out, indent + 2);
                pad(out, indent + 2);
                fval.render_into(out, indent + 2);
                out.push(')');
            }

            SmtExp::Cond { branches, default } => {
                let mut lowered = (**default).clone();
                for (test, value) in branches.iter().rev() {
                    lowered = SmtExp::ite(test.clone(), value.clone(), lowered);
                }
                lowered.render_into(out, indent);
            }

            SmtExp::Match {
                scrutinee,
                branches,
            } => {
                out.push_str("(match ");
                scrutinee.render_into(out, indent);
                out.push_str(" (");
                for branch in branches {
                    pad(out, indent + 2);
                    out.push('(');
                    if branch.binders.is_empty() {
                        out.push_str(&branch.ctor);
                    } else {
                        out.push('(');
                        out.push_str(&branch.ctor);
                        for binder in &branch.binders {
                            out.push(' ');
                            out.push_str(binder);
                        }
                        out.push(')');
                    }
                    out.push(' ');
                    branch.body.render_into(out, indent + 2);
                    out.push(')');
                }
                out.push_str("))");
            }

            SmtExp::Forall { bindings, body } | SmtExp::Exists { bindings, body } => {
                let quantifier = match self {
                    SmtExp::Forall { .. } => "forall",
                    _ => "exists",
                };
                out.push('(');
                out.push_str(quantifier);
                out.push_str(" (");
                for (i, (vname, sort)) in bindings.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push('(');
                    out.push_str(vname);
                    out.push(' ');
                    out.push_str(&sort.name);
                    out.push(')');
                }
                out.push(')');
                pad(out, indent + 2);
                body.render_into(out, indent + 2);
                out.push(')');
            }

            SmtExp::MaskConstruct { ctor, bits } => {
                out.push('(');
                out.push_str(ctor);
                for bit in bits {
                    out.push(' ');
                    bit.render_into(out, indent);
                }
                out.push(')');
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SmtFunctionDef {
    pub name: String,
    pub params: Vec<(String, SmtSort)>,
    pub result: SmtSort,
    pub body: SmtExp,
}

impl SmtFunctionDef {
    fn render_signature(&self, out: &mut String) {
        out.push('(');
        for (i, (pname, sort)) in self.params.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push('(');
            out.push_str(pname);
            out.push(' ');
            out.push_str(&sort.name);
            out.push(')');
        }
        out.push(')');
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("(define-fun ");
        out.push_str(&self.name);
        out.push(' ');
        self.render_signature(&mut out);
        out.push(' ');
        out.push_str(&self.result.name);
        out.push_str("\n  ");
        out.push_str(&self.body.render(2));
        out.push_str("\n)");
        out
    }
}

/// Mutually recursive definitions must be emitted as one joint definition.
pub fn render_define_funs_rec(defs: &[SmtFunctionDef]) -> String {
    debug_assert!(!defs.is_empty());
    let mut out = String::new();
    out.push_str("(define-funs-rec\n  (");
    for def in defs {
        out.push_str("\n    (");
        out.push_str(&def.name);
        out.push(' ');
        def.render_signature(&mut out);
        out.push(' ');
        out.push_str(&def.result.name);
        out.push(')');
    }
    out.push_str("\n  )\n  (");
    for def in defs {
        out.push_str("\n    ");
        out.push_str(&def.body.render(4));
    }
    out.push_str("\n  )\n)");
    out
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SmtDeclareFun {
    pub name: String,
    pub params: Vec<SmtSort>,
    pub result: SmtSort,
}

impl SmtDeclareFun {
    pub fn render(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|sort| sort.name.as_str()).collect();
        format!(
            "(declare-fun {} ({}) {})",
            self.name,
            params.join(" "),
            self.result.name
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn calls_render_as_s_expressions() {
        let exp = SmtExp::call(
            "bvadd",
            vec![SmtExp::Var("x".to_owned()), SmtExp::Const("(_ bv1 16)".to_owned())],
        );
        assert_eq!(exp.render(0), "(bvadd x (_ bv1 16))");
    }

    #[test]
    fn nullary_calls_render_bare() {
        let exp = SmtExp::call("$c", vec![]);
        assert_eq!(exp.render(0), "$c");
    }

    #[test]
    fn cond_lowers_to_nested_ite() {
        let exp = SmtExp::Cond {
            branches: vec![
                (SmtExp::Var("a".to_owned()), SmtExp::Const("1".to_owned())),
                (SmtExp::Var("b".to_owned()), SmtExp::Const("2".to_owned())),
            ],
            default: Box::new(SmtExp::Const("3".to_owned())),
        };
        let rendered = exp.render(0);
        assert_eq!(rendered.matches("(ite ").count(), 2);
        assert!(rendered.contains('1'));
        assert!(rendered.contains('2'));
        assert!(rendered.contains('3'));
        assert_eq!(rendered.matches(')').count(), rendered.matches('(').count());
    }

    #[test]
    fn match_uses_native_pattern_syntax() {
        let exp = SmtExp::Match {
            scrutinee: Box::new(SmtExp::Var("v".to_owned())),
            branches: vec![
                MatchBranch {
                    ctor: "$Box_Int".to_owned(),
                    binders: vec!["n".to_owned()],
                    body: SmtExp::Var("n".to_owned()),
                },
                MatchBranch {
                    ctor: "$Box_None".to_owned(),
                    binders: vec![],
                    body: SmtExp::Const("(_ bv0 16)".to_owned()),
                },
            ],
        };
        let rendered = exp.render(0);
        assert!(rendered.starts_with("(match v ("));
        assert!(rendered.contains("(($Box_Int n) n)"));
        assert!(rendered.contains("($Box_None "));
    }

    #[test]
    fn callee_collection_sees_through_all_node_kinds() {
        let exp = SmtExp::let_in(
            "t",
            SmtExp::CallGeneral {
                fname: "$i_helper".to_owned(),
                args: vec![SmtExp::Var("x".to_owned())],
            },
            SmtExp::ite(
                SmtExp::call("$is_err", vec![SmtExp::Var("t".to_owned())]),
                SmtExp::Var("t".to_owned()),
                SmtExp::CallMasked {
                    fname: "$i_masked".to_owned(),
                    args: vec![],
                    mask: Box::new(SmtExp::MaskConstruct {
                        ctor: "$Mask_2@mk".to_owned(),
                        bits: vec![SmtExp::bool_const(true), SmtExp::bool_const(false)],
                    }),
                },
            ),
        );
        let mut names = BTreeSet::new();
        exp.collect_callee_names(&mut names);
        for expected in ["$i_helper", "$is_err", "$i_masked", "$Mask_2@mk"] {
            assert!(names.contains(expected), "missing {}", expected);
        }
    }

    #[test]
    fn define_funs_rec_renders_joint_definition() {
        let def = SmtFunctionDef {
            name: "$i_even".to_owned(),
            params: vec![("n".to_owned(), SmtSort::new("Int", "BigInt"))],
            result: SmtSort::new("Bool", "Bool"),
            body: SmtExp::bool_const(true),
        };
        let odd = SmtFunctionDef {
            name: "$i_odd".to_owned(),
            ..def.clone()
        };
        let rendered = render_define_funs_rec(&[def, odd]);
        assert!(rendered.starts_with("(define-funs-rec"));
        assert!(rendered.contains("($i_even ((n Int)) Bool)"));
        assert!(rendered.contains("($i_odd ((n Int)) Bool)"));
    }
}
