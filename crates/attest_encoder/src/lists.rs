//! The persistent-list encoding.
//!
//! A list value is a concatenation tree: leaf nodes for small literals and
//! symbolic (havoc'd) lists, interior nodes for concatenation, slicing, and
//! the axiomatized large operations. Node constructors are registered lazily;
//! only the kinds a program actually uses appear in the emitted `$List`
//! datatype, which joins the orchestrator's joint datatype group. Sizes and
//! indices live in the solver's unbounded `Int` domain; the body translator
//! converts at the bitvector boundary.

use attest_common::config::EncodeOptions;
use attest_common::data::assembly::{well_known, TypeKey};
use attest_common::data::smt::{
    render_define_funs_rec, MatchBranch, SmtExp, SmtFunctionDef, SmtSort,
};
use std::collections::BTreeSet;
use std::fmt::Write;

use crate::boxing::{BoxEmitter, BoxKind, DataCtor, DataDef, LIST_SORT};
use crate::error::EncodeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NodeKind {
    Lit1,
    Lit2,
    Lit3,
    Concat2,
    Slice,
    Havoc,
    Fill,
    Range,
    Filter,
    Map,
}

impl NodeKind {
    fn ctor(self) -> &'static str {
        match self {
            NodeKind::Lit1 => "$List@lit1",
            NodeKind::Lit2 => "$List@lit2",
            NodeKind::Lit3 => "$List@lit3",
            NodeKind::Concat2 => "$List@concat2",
            NodeKind::Slice => "$List@slice",
            NodeKind::Havoc => "$List@havoc",
            NodeKind::Fill => "$List@fill",
            NodeKind::Range => "$List@range",
            NodeKind::Filter => "$List@filter",
            NodeKind::Map => "$List@map",
        }
    }
}

/// One registered large-operation instance: the `$BTerm -> _` wrapper
/// function the body translator synthesized for its callback. Instances are
/// axiomatized over all source lists, so a single instance id serves every
/// call site sharing the callback.
#[derive(Clone, Debug)]
struct OpInstance {
    id: usize,
    wrapper: String,
}

pub struct ListEncoder {
    used: BTreeSet<NodeKind>,
    accessors_used: bool,
    sum_used: bool,
    next_instance: usize,
    map_instances: Vec<OpInstance>,
    filter_instances: Vec<OpInstance>,
    int_width: u32,
    /// `$BTerm` constructor (and its selector) for boxed bounded ints, used by
    /// the `range` and `sum` encodings.
    int_box_ctor: String,
    int_box_sel: String,
}

fn int_const(n: i64) -> SmtExp {
    if n < 0 {
        SmtExp::Const(format!("(- {})", -n))
    } else {
        SmtExp::Const(n.to_string())
    }
}

fn var(name: &str) -> SmtExp {
    SmtExp::Var(name.to_owned())
}

impl ListEncoder {
    pub fn new(boxing: &mut BoxEmitter, opts: &EncodeOptions) -> Result<Self, EncodeError> {
        let int_key = TypeKey(well_known::INT.to_owned());
        let (int_box_ctor, int_box_sel) = boxing.box_ctor(&int_key, BoxKind::Term)?;
        Ok(ListEncoder {
            used: BTreeSet::new(),
            accessors_used: false,
            sum_used: false,
            next_instance: 0,
            map_instances: Vec::new(),
            filter_instances: Vec::new(),
            int_width: opts.int_width,
            int_box_ctor,
            int_box_sel,
        })
    }

    pub fn list_sort(&self) -> SmtSort {
        SmtSort::named(LIST_SORT)
    }

    fn node(&mut self, kind: NodeKind, args: Vec<SmtExp>) -> SmtExp {
        self.used.insert(kind);
        SmtExp::call(kind.ctor(), args)
    }

    /// A literal list of already-boxed elements. Up to three elements use a
    /// direct leaf; longer literals fold into a concatenation tree.
    pub fn literal(&mut self, mut elems: Vec<SmtExp>) -> SmtExp {
        match elems.len() {
            0 => {
                // The empty list is a zero-length slice of an arbitrary node.
                let unit = self.node(NodeKind::Lit1, vec![self.opaque_elem()]);
                self.slice(unit, int_const(0), int_const(0))
            }
            1 => self.node(NodeKind::Lit1, elems),
            2 => self.node(NodeKind::Lit2, elems),
            3 => self.node(NodeKind::Lit3, elems),
            _ => {
                let rest = elems.split_off(3);
                let head = self.node(NodeKind::Lit3, elems);
                let tail = self.literal(rest);
                self.concat2(head, tail)
            }
        }
    }

    fn opaque_elem(&self) -> SmtExp {
        SmtExp::call("$BTerm@opaque", vec![SmtExp::Const("0".to_owned())])
    }

    pub fn concat2(&mut self, left: SmtExp, right: SmtExp) -> SmtExp {
        self.node(NodeKind::Concat2, vec![left, right])
    }

    pub fn slice(&mut self, src: SmtExp, from: SmtExp, len: SmtExp) -> SmtExp {
        self.node(NodeKind::Slice, vec![src, from, len])
    }

    pub fn fill(&mut self, value: SmtExp, len: SmtExp) -> SmtExp {
        self.node(NodeKind::Fill, vec![value, len])
    }

    pub fn range(&mut self, from: SmtExp, to: SmtExp) -> SmtExp {
        self.node(NodeKind::Range, vec![from, to])
    }

    /// A fully symbolic list, identified by a havoc id the orchestrator mints.
    pub fn havoc_node(&mut self, id: SmtExp) -> SmtExp {
        self.node(NodeKind::Havoc, vec![id])
    }

    pub fn get(&mut self, list: SmtExp, index: SmtExp) -> SmtExp {
        self.accessors_used = true;
        SmtExp::call("$ListGet", vec![list, index])
    }

    pub fn size(&mut self, list: SmtExp) -> SmtExp {
        self.accessors_used = true;
        SmtExp::call("$ListSize", vec![list])
    }

    pub fn sum(&mut self, list: SmtExp) -> SmtExp {
        self.accessors_used = true;
        self.sum_used = true;
        SmtExp::call("$ListSum", vec![list])
    }

    /// Registers a `map` instance; `wrapper` is a synthesized total function
    /// `$BTerm -> $BTerm` applying the mapped invocation to a boxed element.
    pub fn map_node(&mut self, src: SmtExp, wrapper: &str) -> SmtExp {
        let id = self.next_instance;
        self.next_instance += 1;
        self.map_instances.push(OpInstance {
            id,
            wrapper: wrapper.to_owned(),
        });
        self.node(NodeKind::Map, vec![src, int_const(id as i64)])
    }

    /// Registers a `filter` instance; `pred_wrapper` is a synthesized total
    /// predicate `$BTerm -> Bool`. The result node carries the instance id of
    /// an index-sequence: for any source list, the sorted positions where the
    /// predicate holds.
    pub fn filter_node(&mut self, src: SmtExp, pred_wrapper: &str) -> SmtExp {
        let id = self.register_filter(pred_wrapper);
        self.node(NodeKind::Filter, vec![src, int_const(id as i64)])
    }

    /// `find`: the first source position satisfying the predicate. Returns
    /// `(index, found)`; the caller encodes the not-found fault.
    pub fn find_first(&mut self, src: SmtExp, pred_wrapper: &str) -> (SmtExp, SmtExp) {
        let id = self.register_filter(pred_wrapper);
        let q = int_const(id as i64);
        let index = SmtExp::call("$ISeqAt", vec![q.clone(), src.clone(), int_const(0)]);
        let found = SmtExp::call(
            ">",
            vec![SmtExp::call("$ISeqLen", vec![q, src]), int_const(0)],
        );
        (index, found)
    }

    fn register_filter(&mut self, pred_wrapper: &str) -> usize {
        let id = self.next_instance;
        self.next_instance += 1;
        self.filter_instances.push(OpInstance {
            id,
            wrapper: pred_wrapper.to_owned(),
        });
        id
    }

    /// Constant-folds the size of a tree built purely from literal, concat2,
    /// and constant-offset slice nodes.
    pub fn fold_size(&self, exp: &SmtExp) -> Option<i64> {
        match exp {
            SmtExp::CallSimple { fname, args } => match fname.as_str() {
                "$List@lit1" => Some(1),
                "$List@lit2" => Some(2),
                "$List@lit3" => Some(3),
                "$List@concat2" => Some(self.fold_size(&args[0])? + self.fold_size(&args[1])?),
                "$List@slice" => fold_int(&args[2]),
                _ => None,
            },
            _ => None,
        }
    }

    /// Constant-folds `get` over the same structural subset. `None` when the
    /// tree is symbolic or the index escapes the folded structure.
    pub fn fold_get(&self, exp: &SmtExp, index: i64) -> Option<SmtExp> {
        if index < 0 {
            return None;
        }
        match exp {
            SmtExp::CallSimple { fname, args } => match fname.as_str() {
                "$List@lit1" | "$List@lit2" | "$List@lit3" => {
                    args.get(index as usize).cloned()
                }
                "$List@concat2" => {
                    let left_size = self.fold_size(&args[0])?;
                    if index < left_size {
                        self.fold_get(&args[0], index)
                    } else {
                        self.fold_get(&args[1], index - left_size)
                    }
                }
                "$List@slice" => {
                    let from = fold_int(&args[1])?;
                    let len = fold_int(&args[2])?;
                    if index < len {
                        self.fold_get(&args[0], from + index)
                    } else {
                        None
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// The `$List` datatype for the joint group. The havoc leaf is always
    /// present so the datatype is never empty and symbolic inputs always have
    /// a representation.
    pub fn datatype_def(&self) -> DataDef {
        let bterm = SmtSort::named("$BTerm");
        let list = SmtSort::named(LIST_SORT);
        let int = SmtSort::new("Int", "BigInt");

        let mut kinds = self.used.clone();
        kinds.insert(NodeKind::Havoc);

        let ctors = kinds
            .iter()
            .map(|kind| {
                let name = kind.ctor();
                let field = |suffix: &str, sort: &SmtSort| {
                    (format!("{}@{}", name, suffix), sort.clone())
                };
                let fields = match kind {
                    NodeKind::Lit1 => vec![field("0", &bterm)],
                    NodeKind::Lit2 => vec![field("0", &bterm), field("1", &bterm)],
                    NodeKind::Lit3 => {
                        vec![field("0", &bterm), field("1", &bterm), field("2", &bterm)]
                    }
                    NodeKind::Concat2 => vec![field("l", &list), field("r", &list)],
                    NodeKind::Slice => {
                        vec![field("src", &list), field("from", &int), field("len", &int)]
                    }
                    NodeKind::Havoc => vec![field("id", &int)],
                    NodeKind::Fill => vec![field("v", &bterm), field("n", &int)],
                    NodeKind::Range => vec![field("a", &int), field("b", &int)],
                    NodeKind::Filter => vec![field("src", &list), field("q", &int)],
                    NodeKind::Map => vec![field("src", &list), field("f", &int)],
                };
                DataCtor {
                    name: name.to_owned(),
                    fields,
                }
            })
            .collect();

        DataDef {
            name: LIST_SORT.to_owned(),
            ctors,
        }
    }

    fn size_branch(&self, kind: NodeKind) -> MatchBranch {
        let (binders, body) = match kind {
            NodeKind::Lit1 => (vec!["v0"], int_const(1)),
            NodeKind::Lit2 => (vec!["v0", "v1"], int_const(2)),
            NodeKind::Lit3 => (vec!["v0", "v1", "v2"], int_const(3)),
            NodeKind::Concat2 => (
                vec!["l", "r"],
                SmtExp::call(
                    "+",
                    vec![
                        SmtExp::call("$ListSize", vec![var("l")]),
                        SmtExp::call("$ListSize", vec![var("r")]),
                    ],
                ),
            ),
            // Slices are constructed well-formed; bounds are the builder's
            // obligation.
            NodeKind::Slice => (vec!["s", "f", "n"], var("n")),
            NodeKind::Havoc => (
                vec!["id"],
                SmtExp::call("$HavocListSize", vec![var("id")]),
            ),
            NodeKind::Fill => (vec!["v", "n"], var("n")),
            NodeKind::Range => (
                vec!["a", "b"],
                SmtExp::ite(
                    SmtExp::call("<", vec![var("b"), var("a")]),
                    int_const(0),
                    SmtExp::call("-", vec![var("b"), var("a")]),
                ),
            ),
            NodeKind::Filter => (
                vec!["s", "q"],
                SmtExp::call("$ISeqLen", vec![var("q"), var("s")]),
            ),
            NodeKind::Map => (
                vec!["s", "f"],
                SmtExp::call("$ListSize", vec![var("s")]),
            ),
        };
        MatchBranch {
            ctor: kind.ctor().to_owned(),
            binders: binders.into_iter().map(|b| b.to_owned()).collect(),
            body,
        }
    }

    fn get_branch(&self, kind: NodeKind) -> MatchBranch {
        let i = || var("i");
        let (binders, body) = match kind {
            NodeKind::Lit1 => (vec!["v0"], var("v0")),
            NodeKind::Lit2 => (
                vec!["v0", "v1"],
                SmtExp::ite(SmtExp::eq(i(), int_const(0)), var("v0"), var("v1")),
            ),
            NodeKind::Lit3 => (
                vec!["v0", "v1", "v2"],
                SmtExp::ite(
                    SmtExp::eq(i(), int_const(0)),
                    var("v0"),
                    SmtExp::ite(SmtExp::eq(i(), int_const(1)), var("v1"), var("v2")),
                ),
            ),
            NodeKind::Concat2 => (
                vec!["l", "r"],
                SmtExp::ite(
                    SmtExp::call(
                        "<",
                        vec![i(), SmtExp::call("$ListSize", vec![var("l")])],
                    ),
                    SmtExp::call("$ListGet", vec![var("l"), i()]),
                    SmtExp::call(
                        "$ListGet",
                        vec![
                            var("r"),
                            SmtExp::call(
                                "-",
                                vec![i(), SmtExp::call("$ListSize", vec![var("l")])],
                            ),
                        ],
                    ),
                ),
            ),
            NodeKind::Slice => (
                vec!["s", "f", "n"],
                SmtExp::call(
                    "$ListGet",
                    vec![var("s"), SmtExp::call("+", vec![var("f"), i()])],
                ),
            ),
            NodeKind::Havoc => (
                vec!["id"],
                SmtExp::call("$HavocListGet", vec![var("id"), i()]),
            ),
            NodeKind::Fill => (vec!["v", "n"], var("v")),
            NodeKind::Range => (
                vec!["a", "b"],
                SmtExp::call(
                    &self.int_box_ctor,
                    vec![SmtExp::call(
                        format!("(_ int2bv {})", self.int_width),
                        vec![SmtExp::call("+", vec![var("a"), i()])],
                    )],
                ),
            ),
            NodeKind::Filter => (
                vec!["s", "q"],
                SmtExp::call(
                    "$ListGet",
                    vec![
                        var("s"),
                        SmtExp::call("$ISeqAt", vec![var("q"), var("s"), i()]),
                    ],
                ),
            ),
            NodeKind::Map => (
                vec!["s", "f"],
                SmtExp::call(
                    "$MapApply",
                    vec![var("f"), SmtExp::call("$ListGet", vec![var("s"), i()])],
                ),
            ),
        };
        MatchBranch {
            ctor: kind.ctor().to_owned(),
            binders: binders.into_iter().map(|b| b.to_owned()).collect(),
            body,
        }
    }

    fn sum_branch(&self, kind: NodeKind) -> MatchBranch {
        let unbox = |v: SmtExp| {
            SmtExp::call(
                "bv2nat",
                vec![SmtExp::call(&self.int_box_sel, vec![v])],
            )
        };
        let rebuild_fallback = |ctor: &str, binders: &[&str]| {
            SmtExp::call(
                "$ListSumU",
                vec![SmtExp::call(
                    ctor,
                    binders.iter().map(|b| var(b)).collect(),
                )],
            )
        };
        let (binders, body): (Vec<&str>, SmtExp) = match kind {
            NodeKind::Lit1 => (vec!["v0"], unbox(var("v0"))),
            NodeKind::Lit2 => (
                vec!["v0", "v1"],
                SmtExp::call("+", vec![unbox(var("v0")), unbox(var("v1"))]),
            ),
            NodeKind::Lit3 => (
                vec!["v0", "v1", "v2"],
                SmtExp::call(
                    "+",
                    vec![unbox(var("v0")), unbox(var("v1")), unbox(var("v2"))],
                ),
            ),
            NodeKind::Concat2 => (
                vec!["l", "r"],
                SmtExp::call(
                    "+",
                    vec![
                        SmtExp::call("$ListSum", vec![var("l")]),
                        SmtExp::call("$ListSum", vec![var("r")]),
                    ],
                ),
            ),
            NodeKind::Fill => (
                vec!["v", "n"],
                SmtExp::call("*", vec![var("n"), unbox(var("v"))]),
            ),
            NodeKind::Map => (vec!["s", "f"], rebuild_fallback("$List@map", &["s", "f"])),
            NodeKind::Slice => (
                vec!["s", "f", "n"],
                rebuild_fallback("$List@slice", &["s", "f", "n"]),
            ),
            NodeKind::Havoc => (vec!["id"], rebuild_fallback("$List@havoc", &["id"])),
            NodeKind::Range => (vec!["a", "b"], rebuild_fallback("$List@range", &["a", "b"])),
            NodeKind::Filter => (vec!["s", "q"], rebuild_fallback("$List@filter", &["s", "q"])),
        };
        MatchBranch {
            ctor: kind.ctor().to_owned(),
            binders: binders.into_iter().map(|b| b.to_owned()).collect(),
            body,
        }
    }

    /// Everything beyond the datatype itself: uninterpreted theory functions
    /// and the recursive accessor definitions.
    pub fn render_list_decls(&self) -> String {
        let mut out = String::new();
        if !self.accessors_used && self.used.is_empty() {
            return out;
        }

        let mut kinds = self.used.clone();
        kinds.insert(NodeKind::Havoc);

        out.push_str("(declare-fun $HavocListSize (Int) Int)\n");
        out.push_str("(declare-fun $HavocListGet (Int Int) $BTerm)\n");
        out.push_str("(assert (forall ((id Int)) (>= ($HavocListSize id) 0)))\n");
        if kinds.contains(&NodeKind::Filter) || !self.filter_instances.is_empty() {
            out.push_str("(declare-fun $ISeqLen (Int $List) Int)\n");
            out.push_str("(declare-fun $ISeqAt (Int $List Int) Int)\n");
        }
        if kinds.contains(&NodeKind::Map) {
            out.push_str("(declare-fun $MapApply (Int $BTerm) $BTerm)\n");
        }
        if self.sum_used {
            out.push_str("(declare-fun $ListSumU ($List) Int)\n");
        }

        let list_param = vec![("l".to_owned(), self.list_sort())];
        let int_sort = SmtSort::new("Int", "BigInt");
        let mut defs = vec![
            SmtFunctionDef {
                name: "$ListSize".to_owned(),
                params: list_param.clone(),
                result: int_sort.clone(),
                body: SmtExp::Match {
                    scrutinee: Box::new(var("l")),
                    branches: kinds.iter().map(|&k| self.size_branch(k)).collect(),
                },
            },
            SmtFunctionDef {
                name: "$ListGet".to_owned(),
                params: vec![
                    ("l".to_owned(), self.list_sort()),
                    ("i".to_owned(), int_sort.clone()),
                ],
                result: SmtSort::named("$BTerm"),
                body: SmtExp::Match {
                    scrutinee: Box::new(var("l")),
                    branches: kinds.iter().map(|&k| self.get_branch(k)).collect(),
                },
            },
        ];
        if self.sum_used {
            defs.push(SmtFunctionDef {
                name: "$ListSum".to_owned(),
                params: list_param,
                result: int_sort,
                body: SmtExp::Match {
                    scrutinee: Box::new(var("l")),
                    branches: kinds.iter().map(|&k| self.sum_branch(k)).collect(),
                },
            });
        }
        out.push_str(&render_define_funs_rec(&defs));
        out.push('\n');
        out
    }

    /// Per-instance axioms tying `$MapApply`/`$ISeqAt` to their callback
    /// wrappers. Rendered after the function definitions because the wrappers
    /// are ordinary `define-fun`s.
    pub fn render_op_axioms(&self) -> String {
        let mut out = String::new();
        for inst in &self.map_instances {
            let _ = writeln!(
                out,
                "(assert (forall ((v $BTerm)) (= ($MapApply {} v) ({} v))))",
                inst.id, inst.wrapper
            );
        }
        for inst in &self.filter_instances {
            out.push_str(&self.render_filter_axioms(inst));
        }
        out
    }

    /// The index-sequence axioms for one filter/find instance, quantified
    /// over every source list: non-negative length, in-bounds strictly
    /// increasing positions that satisfy the predicate, and completeness.
    fn render_filter_axioms(&self, inst: &OpInstance) -> String {
        let mut out = String::new();
        let q = inst.id;
        let pred = &inst.wrapper;
        let _ = writeln!(
            out,
            "(assert (forall ((s $List)) (>= ($ISeqLen {} s) 0)))",
            q
        );
        let _ = writeln!(
            out,
            "(assert (forall ((s $List) (i Int)) (=> (and (>= i 0) (< i ($ISeqLen {q} s))) \
             (and (>= ($ISeqAt {q} s i) 0) (< ($ISeqAt {q} s i) ($ListSize s)) \
             ({pred} ($ListGet s ($ISeqAt {q} s i)))))))",
            q = q,
            pred = pred
        );
        let _ = writeln!(
            out,
            "(assert (forall ((s $List) (i Int)) (=> (and (>= i 0) (< i (- ($ISeqLen {q} s) 1))) \
             (< ($ISeqAt {q} s i) ($ISeqAt {q} s (+ i 1))))))",
            q = q
        );
        let _ = writeln!(
            out,
            "(assert (forall ((s $List) (j Int)) (=> (and (>= j 0) (< j ($ListSize s)) \
             ({pred} ($ListGet s j))) \
             (exists ((i Int)) (and (>= i 0) (< i ($ISeqLen {q} s)) (= ($ISeqAt {q} s i) j))))))",
            q = q,
            pred = pred
        );
        out
    }
}

fn fold_int(exp: &SmtExp) -> Option<i64> {
    match exp {
        SmtExp::Const(text) => text.parse().ok(),
        _ => None,
    }
}
