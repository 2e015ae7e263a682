//! The graph-structured parse stack.
//!
//! Every version of the stack is a head pointing into a shared graph of
//! nodes. A node can have several links to predecessor nodes, one per way
//! of reaching it, so that versions which converge on the same state share
//! their history. Nodes live in an arena, are addressed by index and carry
//! an explicit reference count; released nodes go back to a free list.

use std::{
    collections::HashSet,
    io::{self, Write},
    mem,
};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    alloc::{AllocationBudget, AllocationError},
    error_costs::{ERROR_COST_PER_RECOVERY, ERROR_STATE},
    language::{Language, StateId, BUILTIN_SYM_ERROR_REPEAT},
    length::Length,
    subtree::{external_scanner_state_eq, Subtree, SubtreePool},
};

const MAX_LINK_COUNT: usize = 8;
const MAX_ITERATOR_COUNT: usize = 64;

pub type StackVersion = usize;
pub const STACK_VERSION_NONE: StackVersion = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeId(u32);

impl NodeId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
struct StackLink {
    node: NodeId,
    /// `None` marks the start of error recovery.
    subtree: Option<Subtree>,
    is_pending: bool,
}

#[derive(Debug)]
struct StackNode {
    state: StateId,
    position: Length,
    links: SmallVec<[StackLink; 2]>,
    ref_count: u32,
    error_cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StackStatus {
    Active,
    Paused,
    Halted,
}

#[derive(Debug)]
struct StackHead {
    node: NodeId,
    summary: Option<Vec<StackSummaryEntry>>,
    node_count_at_last_error: u32,
    last_external_token: Option<Subtree>,
    lookahead_when_paused: Option<Subtree>,
    status: StackStatus,
}

#[derive(Clone, Debug)]
struct StackIterator {
    node: NodeId,
    subtrees: Vec<Subtree>,
    subtree_count: u32,
    is_pending: bool,
}

/// The subtrees popped along one path, and the version left at its base.
#[derive(Debug)]
pub struct StackSlice {
    pub subtrees: Vec<Subtree>,
    pub version: StackVersion,
}

/// A state reachable by popping `depth` subtrees, used to find places to
/// resume after an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSummaryEntry {
    pub position: Length,
    pub depth: u32,
    pub state: StateId,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct StackAction: u8 {
        const POP = 1 << 0;
        const STOP = 1 << 1;
    }
}

#[derive(Debug)]
pub struct Stack {
    heads: Vec<StackHead>,
    nodes: Vec<StackNode>,
    free_nodes: Vec<NodeId>,
    base_node: NodeId,
    release_stack: Vec<NodeId>,
    budget: AllocationBudget,
    pub(crate) subtree_pool: SubtreePool,
}

fn subtree_node_count(subtree: &Subtree) -> u32 {
    let mut count = subtree.visible_descendant_count();
    if subtree.visible() {
        count += 1;
    }
    // Errors are counted so that versions in recovery still progress.
    if subtree.symbol() == BUILTIN_SYM_ERROR_REPEAT {
        count += 1;
    }
    count
}

fn subtree_is_equivalent(left: Option<&Subtree>, right: Option<&Subtree>) -> bool {
    let (left, right) = match (left, right) {
        (None, None) => return true,
        (Some(left), Some(right)) => (left, right),
        _ => return false,
    };
    if left.ptr_eq(right) {
        return true;
    }
    if left.symbol() != right.symbol() {
        return false;
    }
    if left.error_cost() > 0 && right.error_cost() > 0 {
        return true;
    }
    left.padding().bytes == right.padding().bytes
        && left.size().bytes == right.size().bytes
        && left.child_count() == right.child_count()
        && left.extra() == right.extra()
        && external_scanner_state_eq(Some(left), Some(right))
}

fn dynamic_precedence_of(subtree: Option<&Subtree>) -> i32 {
    subtree.map_or(0, Subtree::dynamic_precedence)
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    /// A stack with a single version in the start state.
    #[must_use]
    pub fn new() -> Self {
        let base = StackNode {
            state: 1,
            position: Length::ZERO,
            links: SmallVec::new(),
            ref_count: 1,
            error_cost: 0,
            node_count: 0,
            dynamic_precedence: 0,
        };
        let mut stack = Self {
            heads: Vec::with_capacity(4),
            nodes: vec![base],
            free_nodes: Vec::new(),
            base_node: NodeId(0),
            release_stack: Vec::new(),
            budget: AllocationBudget::default(),
            subtree_pool: SubtreePool::new(),
        };
        stack.clear();
        stack
    }

    /// Bound the number of nodes that can be pushed from now on.
    pub fn set_budget(&mut self, budget: AllocationBudget) {
        self.budget = budget;
    }

    #[inline]
    fn node(&self, id: NodeId) -> &StackNode {
        &self.nodes[id.index()]
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut StackNode {
        &mut self.nodes[id.index()]
    }

    #[inline]
    fn head_node(&self, version: StackVersion) -> &StackNode {
        self.node(self.heads[version].node)
    }

    fn retain_node(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        debug_assert!(node.ref_count > 0);
        node.ref_count += 1;
    }

    fn release_node(&mut self, id: NodeId) {
        let mut work = mem::take(&mut self.release_stack);
        work.push(id);
        while let Some(id) = work.pop() {
            let node = &mut self.nodes[id.index()];
            debug_assert!(node.ref_count > 0);
            node.ref_count -= 1;
            if node.ref_count > 0 {
                continue;
            }
            let links = mem::take(&mut node.links);
            for link in links {
                if let Some(subtree) = link.subtree {
                    self.subtree_pool.release(subtree);
                }
                work.push(link.node);
            }
            self.free_nodes.push(id);
        }
        self.release_stack = work;
    }

    fn allocate_node(&mut self, node: StackNode) -> Result<NodeId, AllocationError> {
        self.budget.charge(1)?;
        if let Some(id) = self.free_nodes.pop() {
            self.nodes[id.index()] = node;
            return Ok(id);
        }
        self.nodes.try_reserve(1)?;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        Ok(id)
    }

    /// Create a node on top of `previous`, taking over the caller's
    /// reference to it.
    fn new_node(
        &mut self,
        previous: NodeId,
        subtree: Option<Subtree>,
        is_pending: bool,
        state: StateId,
    ) -> Result<NodeId, AllocationError> {
        let previous_node = self.node(previous);
        let mut node = StackNode {
            state,
            position: previous_node.position,
            links: SmallVec::new(),
            ref_count: 1,
            error_cost: previous_node.error_cost,
            node_count: previous_node.node_count,
            dynamic_precedence: previous_node.dynamic_precedence,
        };
        if let Some(subtree) = &subtree {
            node.error_cost += subtree.error_cost();
            node.position += subtree.total_size();
            node.node_count += subtree_node_count(subtree);
            node.dynamic_precedence += subtree.dynamic_precedence();
        }
        node.links.push(StackLink {
            node: previous,
            subtree,
            is_pending,
        });
        self.allocate_node(node)
    }

    fn add_link(&mut self, target: NodeId, link: StackLink) {
        let mut work = vec![(target, link)];
        'links: while let Some((target, link)) = work.pop() {
            if link.node == target {
                continue;
            }

            for i in 0..self.node(target).links.len() {
                let existing = &self.node(target).links[i];
                if !subtree_is_equivalent(existing.subtree.as_ref(), link.subtree.as_ref()) {
                    continue;
                }

                // The same subtree reached the same predecessor twice: keep
                // the one with the higher dynamic precedence.
                if existing.node == link.node {
                    let precedence = dynamic_precedence_of(link.subtree.as_ref());
                    if precedence > dynamic_precedence_of(existing.subtree.as_ref()) {
                        let link_node_precedence = self.node(link.node).dynamic_precedence;
                        let target_node = self.node_mut(target);
                        let previous = mem::replace(&mut target_node.links[i].subtree, link.subtree);
                        target_node.dynamic_precedence = link_node_precedence + precedence;
                        if let Some(previous) = previous {
                            self.subtree_pool.release(previous);
                        }
                    }
                    continue 'links;
                }

                // Equivalent subtrees over equivalent predecessors: merge the
                // predecessors instead of adding a link.
                let existing_node = self.node(existing.node);
                let link_node = self.node(link.node);
                if existing_node.state == link_node.state
                    && existing_node.position.bytes == link_node.position.bytes
                    && existing_node.error_cost == link_node.error_cost
                {
                    let existing_target = existing.node;
                    let dynamic_precedence =
                        link_node.dynamic_precedence + dynamic_precedence_of(link.subtree.as_ref());
                    for next in link_node.links.iter().rev() {
                        work.push((existing_target, next.clone()));
                    }
                    let target_node = self.node_mut(target);
                    target_node.dynamic_precedence =
                        target_node.dynamic_precedence.max(dynamic_precedence);
                    continue 'links;
                }
            }

            if self.node(target).links.len() >= MAX_LINK_COUNT {
                continue;
            }

            self.retain_node(link.node);
            let link_node = self.node(link.node);
            let mut node_count = link_node.node_count;
            let mut dynamic_precedence = link_node.dynamic_precedence;
            if let Some(subtree) = &link.subtree {
                node_count += subtree_node_count(subtree);
                dynamic_precedence += subtree.dynamic_precedence();
            }
            let target_node = self.node_mut(target);
            target_node.links.push(link);
            target_node.node_count = target_node.node_count.max(node_count);
            target_node.dynamic_precedence = target_node.dynamic_precedence.max(dynamic_precedence);
        }
    }

    fn delete_head(&mut self, head: StackHead) {
        if let Some(token) = head.last_external_token {
            self.subtree_pool.release(token);
        }
        if let Some(lookahead) = head.lookahead_when_paused {
            self.subtree_pool.release(lookahead);
        }
        self.release_node(head.node);
    }

    fn add_version(&mut self, original_version: StackVersion, node: NodeId) -> StackVersion {
        let original = &self.heads[original_version];
        let head = StackHead {
            node,
            summary: None,
            node_count_at_last_error: original.node_count_at_last_error,
            last_external_token: original.last_external_token.clone(),
            lookahead_when_paused: None,
            status: StackStatus::Active,
        };
        self.heads.push(head);
        self.retain_node(node);
        self.heads.len() - 1
    }

    fn add_slice(
        &mut self,
        slices: &mut Vec<StackSlice>,
        original_version: StackVersion,
        node: NodeId,
        subtrees: Vec<Subtree>,
    ) {
        for i in (0..slices.len()).rev() {
            let version = slices[i].version;
            if self.heads[version].node == node {
                slices.insert(i + 1, StackSlice { subtrees, version });
                return;
            }
        }
        let version = self.add_version(original_version, node);
        slices.push(StackSlice { subtrees, version });
    }

    /// Walk every path down from the head of `version`. The callback decides
    /// at each node whether to pop the path walked so far into a new
    /// version and whether to stop following it.
    fn iter(
        &mut self,
        version: StackVersion,
        goal_subtree_count: Option<usize>,
        mut callback: impl FnMut(&StackIterator, &StackNode) -> StackAction,
    ) -> Vec<StackSlice> {
        let include_subtrees = goal_subtree_count.is_some();
        let mut slices = Vec::new();
        let mut iterators = vec![StackIterator {
            node: self.heads[version].node,
            subtrees: Vec::with_capacity(goal_subtree_count.unwrap_or(0)),
            subtree_count: 0,
            is_pending: true,
        }];

        while !iterators.is_empty() {
            let mut i = 0;
            let mut size = iterators.len();
            while i < size {
                let node_id = iterators[i].node;
                let node = self.node(node_id);
                let action = callback(&iterators[i], node);
                let should_pop = action.contains(StackAction::POP);
                let should_stop = action.contains(StackAction::STOP) || node.links.is_empty();

                if should_pop {
                    let mut subtrees = if should_stop {
                        mem::take(&mut iterators[i].subtrees)
                    } else {
                        iterators[i].subtrees.clone()
                    };
                    subtrees.reverse();
                    self.add_slice(&mut slices, version, node_id, subtrees);
                }

                if should_stop {
                    let iterator = iterators.remove(i);
                    for subtree in iterator.subtrees {
                        self.subtree_pool.release(subtree);
                    }
                    size -= 1;
                    continue;
                }

                let link_count = self.node(node_id).links.len();
                for j in 1..=link_count {
                    let (link_index, target) = if j == link_count {
                        (0, i)
                    } else {
                        if iterators.len() >= MAX_ITERATOR_COUNT {
                            continue;
                        }
                        iterators.push(iterators[i].clone());
                        (j, iterators.len() - 1)
                    };
                    let link = &self.nodes[node_id.index()].links[link_index];
                    let iterator = &mut iterators[target];
                    iterator.node = link.node;
                    match &link.subtree {
                        Some(subtree) => {
                            if include_subtrees {
                                iterator.subtrees.push(subtree.clone());
                            }
                            if !subtree.extra() {
                                iterator.subtree_count += 1;
                                if !link.is_pending {
                                    iterator.is_pending = false;
                                }
                            }
                        }
                        None => {
                            iterator.subtree_count += 1;
                            iterator.is_pending = false;
                        }
                    }
                }
                i += 1;
            }
        }

        slices
    }

    #[must_use]
    pub fn version_count(&self) -> usize {
        self.heads.len()
    }

    #[must_use]
    pub fn halted_version_count(&self) -> usize {
        self.heads
            .iter()
            .filter(|head| head.status == StackStatus::Halted)
            .count()
    }

    #[must_use]
    pub fn state(&self, version: StackVersion) -> StateId {
        self.head_node(version).state
    }

    #[must_use]
    pub fn position(&self, version: StackVersion) -> Length {
        self.head_node(version).position
    }

    #[must_use]
    pub fn last_external_token(&self, version: StackVersion) -> Option<&Subtree> {
        self.heads[version].last_external_token.as_ref()
    }

    pub fn set_last_external_token(&mut self, version: StackVersion, token: Option<Subtree>) {
        if let Some(previous) = mem::replace(&mut self.heads[version].last_external_token, token) {
            self.subtree_pool.release(previous);
        }
    }

    /// The error cost of a version, including the cost of the recovery it
    /// is about to perform.
    #[must_use]
    pub fn error_cost(&self, version: StackVersion) -> u32 {
        let head = &self.heads[version];
        let node = self.node(head.node);
        let in_recovery = node.state == ERROR_STATE
            && node.links.first().map_or(true, |link| link.subtree.is_none());
        if head.status == StackStatus::Paused || in_recovery {
            node.error_cost + ERROR_COST_PER_RECOVERY
        } else {
            node.error_cost
        }
    }

    pub fn node_count_since_error(&mut self, version: StackVersion) -> u32 {
        let node_count = self.node(self.heads[version].node).node_count;
        let head = &mut self.heads[version];
        if node_count < head.node_count_at_last_error {
            head.node_count_at_last_error = node_count;
        }
        node_count - head.node_count_at_last_error
    }

    /// Push a subtree onto a version. Pushing `None` in the error state
    /// marks the beginning of a recovery.
    pub fn push(
        &mut self,
        version: StackVersion,
        subtree: Option<Subtree>,
        pending: bool,
        state: StateId,
    ) -> Result<(), AllocationError> {
        let is_error_marker = subtree.is_none();
        let previous = self.heads[version].node;
        let node = self.new_node(previous, subtree, pending, state)?;
        let node_count = self.node(node).node_count;
        let head = &mut self.heads[version];
        if is_error_marker {
            head.node_count_at_last_error = node_count;
        }
        head.node = node;
        Ok(())
    }

    /// Pop `count` non-extra subtrees from a version. Each distinct path
    /// yields a slice; paths ending at the same node share a version.
    pub fn pop_count(&mut self, version: StackVersion, count: u32) -> Vec<StackSlice> {
        self.iter(version, Some(count as usize), |iterator, _| {
            if iterator.subtree_count == count {
                StackAction::POP | StackAction::STOP
            } else {
                StackAction::empty()
            }
        })
    }

    /// Pop the pending subtree at the top of a version, if there is one.
    pub fn pop_pending(&mut self, version: StackVersion) -> Vec<StackSlice> {
        let mut pop = self.iter(version, Some(0), |iterator, _| {
            if iterator.subtree_count >= 1 {
                if iterator.is_pending {
                    StackAction::POP | StackAction::STOP
                } else {
                    StackAction::STOP
                }
            } else {
                StackAction::empty()
            }
        });
        if let Some(first) = pop.first_mut() {
            self.renumber_version(first.version, version);
            first.version = version;
        }
        pop
    }

    /// Pop the children of an ERROR node at the top of a version.
    pub fn pop_error(&mut self, version: StackVersion) -> Option<Vec<Subtree>> {
        let has_error_link = self
            .head_node(version)
            .links
            .iter()
            .any(|link| link.subtree.as_ref().is_some_and(Subtree::is_error));
        if !has_error_link {
            return None;
        }

        let mut found_error = false;
        let mut pop = self.iter(version, Some(1), |iterator, _| {
            match iterator.subtrees.first() {
                Some(first) => {
                    if !found_error && first.is_error() {
                        found_error = true;
                        StackAction::POP | StackAction::STOP
                    } else {
                        StackAction::STOP
                    }
                }
                None => StackAction::empty(),
            }
        });
        debug_assert!(pop.len() <= 1);
        let slice = pop.pop()?;
        self.renumber_version(slice.version, version);
        Some(slice.subtrees)
    }

    /// Pop everything down to the base of every path.
    pub fn pop_all(&mut self, version: StackVersion) -> Vec<StackSlice> {
        self.iter(version, Some(0), |_, node| {
            if node.links.is_empty() {
                StackAction::POP
            } else {
                StackAction::empty()
            }
        })
    }

    /// Record which states are reachable within `max_depth` pops.
    pub fn record_summary(&mut self, version: StackVersion, max_depth: u32) {
        let mut summary = Vec::<StackSummaryEntry>::new();
        self.iter(version, None, |iterator, node| {
            let depth = iterator.subtree_count;
            if depth > max_depth {
                return StackAction::STOP;
            }
            let state = node.state;
            for entry in summary.iter().rev() {
                if entry.depth < depth {
                    break;
                }
                if entry.depth == depth && entry.state == state {
                    return StackAction::empty();
                }
            }
            summary.push(StackSummaryEntry {
                position: node.position,
                depth,
                state,
            });
            StackAction::empty()
        });
        self.heads[version].summary = Some(summary);
    }

    #[must_use]
    pub fn get_summary(&self, version: StackVersion) -> Option<&[StackSummaryEntry]> {
        self.heads[version].summary.as_deref()
    }

    #[must_use]
    pub fn dynamic_precedence(&self, version: StackVersion) -> i32 {
        self.head_node(version).dynamic_precedence
    }

    /// Whether a version has consumed any input since its last error.
    #[must_use]
    pub fn has_advanced_since_error(&self, version: StackVersion) -> bool {
        let head = &self.heads[version];
        let mut node = self.node(head.node);
        if node.error_cost == 0 {
            return true;
        }
        while let Some(link) = node.links.first() {
            let Some(subtree) = &link.subtree else {
                break;
            };
            if subtree.total_bytes() > 0 {
                return true;
            }
            if node.node_count > head.node_count_at_last_error && subtree.error_cost() == 0 {
                node = self.node(link.node);
                continue;
            }
            break;
        }
        false
    }

    pub fn remove_version(&mut self, version: StackVersion) {
        let head = self.heads.remove(version);
        self.delete_head(head);
    }

    /// Move `source` into the slot of `target`, which must precede it,
    /// discarding the version previously there.
    pub fn renumber_version(&mut self, source: StackVersion, target: StackVersion) {
        if source == target {
            return;
        }
        debug_assert!(target < source);
        let mut source_head = self.heads.remove(source);
        if source_head.summary.is_none() {
            source_head.summary = self.heads[target].summary.take();
        }
        let previous = mem::replace(&mut self.heads[target], source_head);
        self.delete_head(previous);
    }

    pub fn swap_versions(&mut self, first: StackVersion, second: StackVersion) {
        self.heads.swap(first, second);
    }

    /// Fork a version. The copy shares all of its history.
    pub fn copy_version(&mut self, version: StackVersion) -> StackVersion {
        let head = &self.heads[version];
        let copy = StackHead {
            node: head.node,
            summary: None,
            node_count_at_last_error: head.node_count_at_last_error,
            last_external_token: head.last_external_token.clone(),
            lookahead_when_paused: head.lookahead_when_paused.clone(),
            status: head.status,
        };
        self.retain_node(copy.node);
        self.heads.push(copy);
        self.heads.len() - 1
    }

    #[must_use]
    pub fn can_merge(&self, first: StackVersion, second: StackVersion) -> bool {
        let head1 = &self.heads[first];
        let head2 = &self.heads[second];
        let node1 = self.node(head1.node);
        let node2 = self.node(head2.node);
        head1.status == StackStatus::Active
            && head2.status == StackStatus::Active
            && node1.state == node2.state
            && node1.position.bytes == node2.position.bytes
            && node1.error_cost == node2.error_cost
            && external_scanner_state_eq(
                head1.last_external_token.as_ref(),
                head2.last_external_token.as_ref(),
            )
    }

    /// Merge `second` into `first` if both sit in the same state at the
    /// same position, removing `second`.
    pub fn merge(&mut self, first: StackVersion, second: StackVersion) -> bool {
        if !self.can_merge(first, second) {
            return false;
        }
        let target = self.heads[first].node;
        let links = self.head_node(second).links.clone();
        for link in links {
            self.add_link(target, link);
        }
        if self.node(target).state == ERROR_STATE {
            self.heads[first].node_count_at_last_error = self.node(target).node_count;
        }
        self.remove_version(second);
        true
    }

    pub fn halt(&mut self, version: StackVersion) {
        self.heads[version].status = StackStatus::Halted;
    }

    pub fn pause(&mut self, version: StackVersion, lookahead: Subtree) {
        let node_count = self.head_node(version).node_count;
        let head = &mut self.heads[version];
        head.status = StackStatus::Paused;
        head.node_count_at_last_error = node_count;
        if let Some(previous) = head.lookahead_when_paused.replace(lookahead) {
            self.subtree_pool.release(previous);
        }
    }

    #[must_use]
    pub fn is_active(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Active
    }

    #[must_use]
    pub fn is_halted(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Halted
    }

    #[must_use]
    pub fn is_paused(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Paused
    }

    /// Reactivate a paused version, returning the lookahead it paused on.
    pub fn resume(&mut self, version: StackVersion) -> Option<Subtree> {
        let head = &mut self.heads[version];
        debug_assert_eq!(head.status, StackStatus::Paused);
        head.status = StackStatus::Active;
        head.lookahead_when_paused.take()
    }

    /// Discard every version and start over with one in the start state.
    pub fn clear(&mut self) {
        self.retain_node(self.base_node);
        for head in mem::take(&mut self.heads) {
            self.delete_head(head);
        }
        self.heads.push(StackHead {
            node: self.base_node,
            summary: None,
            node_count_at_last_error: 0,
            last_external_token: None,
            lookahead_when_paused: None,
            status: StackStatus::Active,
        });
    }

    /// The number of arena slots holding live nodes.
    #[must_use]
    pub fn live_node_count(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }

    pub fn print_dot_graph(&mut self, language: &Language, f: &mut impl Write) -> io::Result<()> {
        writeln!(f, "digraph stack {{")?;
        writeln!(f, "rankdir=\"RL\";")?;
        writeln!(f, "edge [arrowhead=none]")?;

        let mut frontier = Vec::new();
        for version in 0..self.heads.len() {
            if self.is_halted(version) {
                continue;
            }
            let node_count = self.node_count_since_error(version);
            let error_cost = self.error_cost(version);
            let head = &self.heads[version];
            writeln!(f, "node_head_{version} [shape=none, label=\"\"]")?;
            write!(f, "node_head_{version} -> node_{} [", head.node.0)?;
            if head.status == StackStatus::Paused {
                write!(f, "color=red ")?;
            }
            write!(
                f,
                "label={version}, fontcolor=blue, weight=10000, labeltooltip=\"node_count: {node_count}\nerror_cost: {error_cost}"
            )?;
            if let Some(summary) = &head.summary {
                write!(f, "\nsummary:")?;
                for entry in summary {
                    write!(f, " {}", entry.state)?;
                }
            }
            if let Some(token) = &head.last_external_token {
                write!(f, "\nexternal_scanner_state:")?;
                for byte in token.external_scanner_state() {
                    write!(f, " {byte:2X}")?;
                }
            }
            writeln!(f, "\"]")?;
            frontier.push(head.node);
        }

        let mut visited = HashSet::new();
        while let Some(id) = frontier.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.node(id);
            write!(f, "node_{} [", id.0)?;
            let is_extra_point = node.links.len() == 1
                && node.links[0].subtree.as_ref().is_some_and(Subtree::extra);
            if node.state == ERROR_STATE {
                write!(f, "label=\"?\"")?;
            } else if is_extra_point {
                write!(f, "shape=point margin=0 label=\"\"")?;
            } else {
                write!(f, "label=\"{}\"", node.state)?;
            }
            writeln!(
                f,
                " tooltip=\"position: {},{}\nnode_count:{}\nerror_cost: {}\ndynamic_precedence: {}\"];",
                node.position.extent.row + 1,
                node.position.extent.column,
                node.node_count,
                node.error_cost,
                node.dynamic_precedence,
            )?;

            for link in &node.links {
                write!(f, "node_{} -> node_{} [", id.0, link.node.0)?;
                if link.is_pending {
                    write!(f, "style=dashed ")?;
                }
                match &link.subtree {
                    None => write!(f, "color=red")?,
                    Some(subtree) => {
                        if subtree.extra() {
                            write!(f, "fontcolor=gray ")?;
                        }
                        write!(f, "label=\"")?;
                        let quoted = subtree.visible() && !subtree.named();
                        if quoted {
                            write!(f, "'")?;
                        }
                        language.write_symbol_as_dot_string(f, subtree.symbol())?;
                        if quoted {
                            write!(f, "'")?;
                        }
                        write!(
                            f,
                            "\" labeltooltip=\"error_cost: {}\ndynamic_precedence: {}\"",
                            subtree.error_cost(),
                            subtree.dynamic_precedence(),
                        )?;
                    }
                }
                writeln!(f, "];")?;
                frontier.push(link.node);
            }
        }

        writeln!(f, "}}")
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        for head in mem::take(&mut self.heads) {
            self.delete_head(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        language::{LanguageBuilder, Symbol, SymbolMetadata},
        lexer::Lexer,
        point::Point,
        subtree::LeafParams,
    };

    fn lex_nothing(_: &mut Lexer<'_>, _: StateId) -> bool {
        false
    }

    fn language() -> Language {
        LanguageBuilder::new("stack", lex_nothing)
            .token("a", SymbolMetadata::NAMED)
            .token("b", SymbolMetadata::NAMED)
            .token("comment", SymbolMetadata::NAMED)
            .state_count(12)
            .build()
            .unwrap()
    }

    fn leaf(symbol: Symbol, size: u32, language: &Language) -> Subtree {
        Subtree::new_leaf(
            LeafParams {
                symbol,
                size: Length::new(size, Point::new(0, size)),
                ..LeafParams::default()
            },
            language,
        )
    }

    fn extra(language: &Language) -> Subtree {
        let mut comment = leaf(3, 1, language);
        comment.set_extra(true);
        comment
    }

    fn symbols(slice: &StackSlice) -> Vec<Symbol> {
        slice.subtrees.iter().map(Subtree::symbol).collect()
    }

    #[test]
    fn push_tracks_state_and_position() {
        let language = language();
        let mut stack = Stack::new();
        assert_eq!(stack.version_count(), 1);
        assert_eq!(stack.state(0), 1);
        stack.push(0, Some(leaf(1, 2, &language)), false, 5).unwrap();
        stack.push(0, Some(leaf(2, 3, &language)), false, 6).unwrap();
        assert_eq!(stack.state(0), 6);
        assert_eq!(stack.position(0).bytes, 5);
        assert_eq!(stack.node_count_since_error(0), 2);
    }

    #[test]
    fn pop_count_skips_extras() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.push(0, Some(extra(&language)), false, 2).unwrap();
        stack.push(0, Some(leaf(2, 1, &language)), false, 3).unwrap();

        let slices = stack.pop_count(0, 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(symbols(&slices[0]), vec![1, 3, 2]);
        let version = slices[0].version;
        assert_eq!(stack.state(version), 1);
        assert_eq!(stack.position(version).bytes, 0);
        // The popped version is new; the original still has everything.
        assert_eq!(stack.version_count(), 2);
        assert_eq!(stack.state(0), 3);
    }

    #[test]
    fn merged_versions_pop_along_every_path() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        let copy = stack.copy_version(0);
        stack.push(0, Some(leaf(1, 1, &language)), false, 4).unwrap();
        stack.push(copy, Some(leaf(2, 1, &language)), false, 4).unwrap();
        assert!(stack.can_merge(0, copy));
        assert!(stack.merge(0, copy));
        assert_eq!(stack.version_count(), 1);

        let slices = stack.pop_count(0, 1);
        assert_eq!(slices.len(), 2);
        // Both paths lead to the same node, so they share one version.
        assert_eq!(slices[0].version, slices[1].version);
        let mut popped = slices.iter().flat_map(symbols).collect::<Vec<_>>();
        popped.sort_unstable();
        assert_eq!(popped, vec![1, 2]);
    }

    #[test]
    fn versions_in_different_states_do_not_merge() {
        let language = language();
        let mut stack = Stack::new();
        let copy = stack.copy_version(0);
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.push(copy, Some(leaf(1, 1, &language)), false, 3).unwrap();
        assert!(!stack.merge(0, copy));
        assert_eq!(stack.version_count(), 2);
    }

    #[test]
    fn pause_resume_and_halt() {
        let language = language();
        let mut stack = Stack::new();
        stack.pause(0, leaf(1, 1, &language));
        assert!(stack.is_paused(0));
        assert_eq!(stack.error_cost(0), ERROR_COST_PER_RECOVERY);
        let lookahead = stack.resume(0).unwrap();
        assert_eq!(lookahead.symbol(), 1);
        assert!(stack.is_active(0));
        stack.halt(0);
        assert_eq!(stack.halted_version_count(), 1);
    }

    #[test]
    fn error_marker_starts_a_recovery() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.push(0, None, false, ERROR_STATE).unwrap();
        assert_eq!(stack.error_cost(0), ERROR_COST_PER_RECOVERY);
        assert_eq!(stack.node_count_since_error(0), 0);
        assert!(stack.pop_error(0).is_none());
    }

    #[test]
    fn summaries_list_reachable_states() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.push(0, Some(leaf(2, 1, &language)), false, 3).unwrap();
        stack.record_summary(0, 16);
        let summary = stack.get_summary(0).unwrap();
        let states = summary.iter().map(|entry| (entry.depth, entry.state)).collect::<Vec<_>>();
        assert_eq!(states, vec![(0, 3), (1, 2), (2, 1)]);

        stack.record_summary(0, 1);
        assert_eq!(stack.get_summary(0).unwrap().len(), 2);
    }

    #[test]
    fn pop_pending_only_pops_pending_subtrees() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        assert!(stack.pop_pending(0).is_empty());
        stack.push(0, Some(leaf(2, 1, &language)), true, 3).unwrap();
        let slices = stack.pop_pending(0);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].version, 0);
        assert_eq!(stack.version_count(), 1);
        assert_eq!(stack.state(0), 2);
    }

    #[test]
    fn budget_limits_pushes() {
        let language = language();
        let mut stack = Stack::new();
        stack.set_budget(AllocationBudget::new(Some(2)));
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        let error = stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap_err();
        assert_eq!(error, AllocationError::BudgetExhausted { limit: 2 });
        assert_eq!(stack.position(0).bytes, 2);
    }

    #[test]
    fn released_nodes_are_recycled() {
        let language = language();
        let mut stack = Stack::new();
        for _ in 0..10 {
            stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        }
        assert_eq!(stack.live_node_count(), 11);
        stack.clear();
        assert_eq!(stack.live_node_count(), 1);
        for _ in 0..10 {
            stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        }
        assert_eq!(stack.nodes.len(), 11);
    }

    #[test]
    fn dot_graph_mentions_every_head() {
        let language = language();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(1, 1, &language)), false, 2).unwrap();
        stack.copy_version(0);
        let mut output = Vec::new();
        stack.print_dot_graph(&language, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("digraph stack {"));
        assert!(output.contains("node_head_0"));
        assert!(output.contains("node_head_1"));
        assert!(output.contains("label=\"a\""));
    }
}
