//! Inlining of `jsr`/`ret` subroutines.
//!
//! Every `jsr` call site gets its own copy of the subroutine it calls: the call becomes
//! `aconst_null; goto <copy>` and each `ret` in the copy becomes a `goto` back to the
//! instruction after the call site. Nested calls are expanded the same way; a subroutine that
//! reaches itself is rejected.
//!
//! Membership is computed by flooding the control-flow graph from each entry point. Calls are
//! followed to their return site rather than into the callee, and exception edges pull in any
//! handler that protects a member. An instruction shared with an enclosing copy stays with
//! that enclosing copy.

use crate::code::{Label, LocalVar, MethodBody, Node, TryCatch};
use crate::instruction::Insn;
use crate::opcodes::*;
use crate::result::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Returns `body` with every subroutine inlined, or a clone when it has none.
pub fn inline_subroutines(body: &MethodBody) -> Result<MethodBody> {
    if !body.has_subroutines() {
        return Ok(body.clone());
    }
    let flow = Flow::new(body)?;
    let mut out = MethodBody::new(body.max_stack, body.max_locals);
    out.attributes = body.attributes.clone();
    let main = Rc::new(Instance::new(
        None,
        flow.reachable_from(0),
        None,
        None,
        &flow,
        &mut out,
    ));

    let mut worklist: VecDeque<Rc<Instance>> = VecDeque::from([main]);
    let mut copies = 0usize;
    while let Some(instance) = worklist.pop_front() {
        flow.emit(&instance, &mut out, &mut worklist)?;
        copies += 1;
    }
    tracing::trace!("inlined {} subroutine copies", copies - 1);
    Ok(out)
}

/// Control-flow facts about the original body.
struct Flow<'a> {
    body: &'a MethodBody,
    graph: DiGraph<usize, ()>,
    /// Node position of every instruction, indexed by instruction number.
    insn_positions: Vec<usize>,
    /// Instruction number of the first instruction at or after each node position.
    next_insn: Vec<Option<usize>>,
    label_positions: HashMap<Label, usize>,
}

impl<'a> Flow<'a> {
    fn new(body: &'a MethodBody) -> Result<Self> {
        let mut insn_positions = Vec::new();
        let mut label_positions = HashMap::new();
        for (pos, node) in body.nodes.iter().enumerate() {
            match node {
                Node::Insn(_) => insn_positions.push(pos),
                Node::Label(label) => {
                    label_positions.insert(*label, pos);
                }
                Node::Line(_) => {}
            }
        }
        let mut next_insn = vec![None; body.nodes.len() + 1];
        let mut upcoming = None;
        for pos in (0..body.nodes.len()).rev() {
            if matches!(body.nodes[pos], Node::Insn(_)) {
                upcoming = Some(insn_positions.partition_point(|&p| p < pos));
            }
            next_insn[pos] = upcoming;
        }

        let mut flow = Self {
            body,
            graph: DiGraph::new(),
            insn_positions,
            next_insn,
            label_positions,
        };
        for k in 0..flow.insn_positions.len() {
            flow.graph.add_node(k);
        }
        for k in 0..flow.insn_positions.len() {
            let Node::Insn(insn) = &body.nodes[flow.insn_positions[k]] else {
                continue;
            };
            let opcode = insn.opcode();
            let mut successors = Vec::new();
            match insn {
                Insn::Jump { opcode: JSR, .. } => successors.push(k + 1),
                Insn::Var { opcode: RET, .. } => {}
                _ => {
                    for target in insn.targets() {
                        successors.push(flow.insn_at(*target)?);
                    }
                    if !is_unconditional(opcode) {
                        successors.push(k + 1);
                    }
                }
            }
            let pos = flow.insn_positions[k];
            for tc in &body.try_catches {
                if flow.position(tc.start)? <= pos && pos < flow.position(tc.end)? {
                    successors.push(flow.insn_at(tc.handler)?);
                }
            }
            for succ in successors {
                if succ < flow.insn_positions.len() {
                    flow.graph
                        .add_edge(NodeIndex::new(k), NodeIndex::new(succ), ());
                }
            }
        }
        Ok(flow)
    }

    fn position(&self, label: Label) -> Result<usize> {
        self.label_positions
            .get(&label)
            .copied()
            .ok_or_else(|| Error::Subroutine(format!("label {} is never placed", label.0)))
    }

    /// Instruction number a label points at.
    fn insn_at(&self, label: Label) -> Result<usize> {
        self.next_insn[self.position(label)?]
            .ok_or_else(|| Error::Subroutine(format!("label {} points past the code", label.0)))
    }

    fn reachable_from(&self, start: usize) -> Vec<bool> {
        let mut members = vec![false; self.insn_positions.len()];
        if start >= members.len() {
            return members;
        }
        let mut dfs = Dfs::new(&self.graph, NodeIndex::new(start));
        while let Some(node) = dfs.next(&self.graph) {
            members[self.graph[node]] = true;
        }
        members
    }

    /// Appends one copy to `out`, queueing the copies its calls need.
    fn emit(
        &self,
        instance: &Rc<Instance>,
        out: &mut MethodBody,
        worklist: &mut VecDeque<Rc<Instance>>,
    ) -> Result<()> {
        let mut previous: Option<Label> = None;
        let mut k = 0usize;
        for (pos, node) in self.body.nodes.iter().enumerate() {
            match node {
                Node::Label(label) => {
                    let clone = instance.clone_of(*label)?;
                    if previous != Some(clone) {
                        out.place(clone);
                        previous = Some(clone);
                    }
                }
                Node::Line(line) => {
                    if self.next_insn[pos].is_some_and(|next| instance.owns(next)) {
                        out.nodes.push(Node::Line(*line));
                    }
                }
                Node::Insn(insn) => {
                    let index = k;
                    k += 1;
                    if !instance.owns(index) {
                        continue;
                    }
                    previous = None;
                    match insn {
                        Insn::Var { opcode: RET, .. } => {
                            let target = instance.return_label.ok_or_else(|| {
                                Error::Subroutine("ret outside of a subroutine".into())
                            })?;
                            out.push(Insn::Jump {
                                opcode: GOTO,
                                target,
                            });
                        }
                        Insn::Jump {
                            opcode: JSR,
                            target,
                        } => {
                            let entry = self.insn_at(*target)?;
                            if instance.calls_from(entry) {
                                return Err(Error::Subroutine(format!(
                                    "recursive call to the subroutine at label {}",
                                    target.0
                                )));
                            }
                            let return_label = out.new_label();
                            let callee = Rc::new(Instance::new(
                                Some(entry),
                                self.reachable_from(entry),
                                Some(Rc::clone(instance)),
                                Some(return_label),
                                self,
                                out,
                            ));
                            let start = callee.jump_target(self, *target)?;
                            out.push(Insn::Simple(ACONST_NULL));
                            out.push(Insn::Jump {
                                opcode: GOTO,
                                target: start,
                            });
                            out.place(return_label);
                            worklist.push_back(callee);
                        }
                        other => {
                            out.push(other.map_targets(|l| instance.jump_target(self, *l))?);
                        }
                    }
                }
            }
        }

        for tc in &self.body.try_catches {
            let start = instance.clone_of(tc.start)?;
            let end = instance.clone_of(tc.end)?;
            if start != end {
                out.try_catches.push(TryCatch {
                    start,
                    end,
                    handler: instance.jump_target(self, tc.handler)?,
                    catch_type: tc.catch_type,
                });
            }
        }
        for var in &self.body.local_vars {
            let start = instance.clone_of(var.start)?;
            let end = instance.clone_of(var.end)?;
            if start != end {
                out.local_vars.push(LocalVar { start, end, ..*var });
            }
        }
        Ok(())
    }
}

/// One copy of the main routine or of a subroutine.
struct Instance {
    entry: Option<usize>,
    members: Vec<bool>,
    parent: Option<Rc<Instance>>,
    /// Where `ret` jumps to in the output.
    return_label: Option<Label>,
    /// Output label standing in for each original label within this copy.
    labels: HashMap<Label, Label>,
}

impl Instance {
    fn new(
        entry: Option<usize>,
        members: Vec<bool>,
        parent: Option<Rc<Instance>>,
        return_label: Option<Label>,
        flow: &Flow<'_>,
        out: &mut MethodBody,
    ) -> Self {
        let mut instance = Self {
            entry,
            members,
            parent,
            return_label,
            labels: HashMap::new(),
        };
        // Labels separated only by instructions this copy does not emit share one clone.
        let mut current: Option<Label> = None;
        let mut k = 0usize;
        for node in &flow.body.nodes {
            match node {
                Node::Label(label) => {
                    let clone = *current.get_or_insert_with(|| out.new_label());
                    instance.labels.insert(*label, clone);
                }
                Node::Insn(_) => {
                    if instance.owns(k) {
                        current = None;
                    }
                    k += 1;
                }
                Node::Line(_) => {}
            }
        }
        instance
    }

    fn ancestors(&self) -> impl Iterator<Item = &Instance> {
        std::iter::successors(self.parent.as_deref(), |p| p.parent.as_deref())
    }

    /// The outermost copy containing instruction `k`, starting from this one.
    fn owner(&self, k: usize) -> Option<&Instance> {
        if !self.members.get(k).copied().unwrap_or(false) {
            return None;
        }
        let mut owner = self;
        for ancestor in self.ancestors() {
            if ancestor.members.get(k).copied().unwrap_or(false) {
                owner = ancestor;
            }
        }
        Some(owner)
    }

    fn owns(&self, k: usize) -> bool {
        self.owner(k).is_some_and(|o| std::ptr::eq(o, self))
    }

    fn calls_from(&self, entry: usize) -> bool {
        self.entry == Some(entry) || self.ancestors().any(|a| a.entry == Some(entry))
    }

    fn clone_of(&self, label: Label) -> Result<Label> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| Error::Subroutine(format!("label {} is never placed", label.0)))
    }

    /// Output label for a jump to `label` made from within this copy.
    fn jump_target(&self, flow: &Flow<'_>, label: Label) -> Result<Label> {
        let k = flow.insn_at(label)?;
        let owner = self
            .owner(k)
            .or_else(|| self.ancestors().find_map(|a| a.owner(k)))
            .ok_or_else(|| {
                Error::Subroutine(format!("jump to label {} leaves the subroutine", label.0))
            })?;
        owner.clone_of(label)
    }
}
