use super::node::{NodeArena, NodeID};

/// Nodes which are not scheduled but still have flow jobs pending.
///
/// These need to be visited on every block even though the schedule does
/// not reach them.
pub(crate) fn unscheduled_with_flow_jobs(nodes: &NodeArena, id: NodeID) -> bool {
    let node = &nodes[id.0];
    !node.sched_tag && !node.flow_jobs.is_empty()
}

/// The list of every integrated node.
///
/// The list is partially sorted: unscheduled nodes with pending flow
/// jobs are kept at the head, so the master loop can stop walking at the
/// first node that does not need a visit. Links live inside the nodes.
#[derive(Debug, Default)]
pub(crate) struct MasterNodeList {
    head: Option<NodeID>,
    tail: Option<NodeID>,
}

impl MasterNodeList {
    pub fn head(&self) -> Option<NodeID> {
        self.head
    }

    /// Append a freshly integrated node.
    pub fn integrate(&mut self, nodes: &mut NodeArena, id: NodeID) {
        nodes[id.0].integrated = true;
        self.push_back(nodes, id);
    }

    pub fn remove(&mut self, nodes: &mut NodeArena, id: NodeID) {
        self.unlink(nodes, id);
        nodes[id.0].integrated = false;
    }

    /// Restore the ordering after the scheduling state or the flow jobs of
    /// a node changed.
    pub fn node_changed(&mut self, nodes: &mut NodeArena, id: NodeID) {
        let node = &nodes[id.0];
        if !node.integrated {
            log::warn!("node {id:?} is not integrated");
            return;
        }

        let Some(sibling) = node.mnl_prev.or(node.mnl_next) else {
            return;
        };

        let wants_head = unscheduled_with_flow_jobs(nodes, id);
        if wants_head != unscheduled_with_flow_jobs(nodes, sibling) {
            self.unlink(nodes, id);
            if wants_head {
                self.push_front(nodes, id);
            } else {
                self.push_back(nodes, id);
            }
        }
    }

    /// Whether the node at the head of the list needs a flow job visit.
    pub fn head_needs_visit(&self, nodes: &NodeArena) -> Option<NodeID> {
        self.head
            .filter(|&id| unscheduled_with_flow_jobs(nodes, id))
    }

    fn push_back(&mut self, nodes: &mut NodeArena, id: NodeID) {
        {
            let node = &mut nodes[id.0];
            node.mnl_prev = self.tail;
            node.mnl_next = None;
        }
        match self.tail {
            Some(tail) => nodes[tail.0].mnl_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn push_front(&mut self, nodes: &mut NodeArena, id: NodeID) {
        {
            let node = &mut nodes[id.0];
            node.mnl_prev = None;
            node.mnl_next = self.head;
        }
        match self.head {
            Some(head) => nodes[head.0].mnl_prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    fn unlink(&mut self, nodes: &mut NodeArena, id: NodeID) {
        let (prev, next) = {
            let node = &mut nodes[id.0];
            (node.mnl_prev.take(), node.mnl_next.take())
        };

        match prev {
            Some(prev) => nodes[prev.0].mnl_next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => nodes[next.0].mnl_prev = prev,
            None => self.tail = prev,
        }
    }

    /// Collect the list in order.
    #[cfg(test)]
    pub fn ids(&self, nodes: &NodeArena) -> Vec<NodeID> {
        let mut ids = Vec::new();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = nodes[id.0].mnl_next;
        }
        ids
    }
}
