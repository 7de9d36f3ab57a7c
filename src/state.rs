//! Node and talkgroup state.
//!
//! All mutable relay state lives in a single [`State`] owned by the
//! dispatcher task, so no locking is needed: the dispatcher is the only
//! writer and processes one datagram at a time.
//!
//! Talkgroup subscriber lists are intrusive doubly linked lists expressed
//! as slot IDs: each slot carries `prev`/`next` links and each talkgroup a
//! `head`. Keying a stream on a talkgroup subscribes the slot at the head
//! of that group's list; the fan-out loop walks the links. Using IDs
//! instead of pointers keeps deletion trivial and the structure free of
//! aliasing.

use std::collections::HashMap;
use std::net::SocketAddr;

use log::info;

use crate::ident;
use crate::parrot::ParrotCapture;

/// First talkgroup number past the valid range.
pub const MAX_TALKGROUP: u32 = 10_000;

/// The scanner talkgroup: subscribers hear every active stream.
pub const SCANNER_TG: u32 = 777;

/// First TAC talkgroup opened at startup.
pub const TAC_TG_START: u32 = 100;

/// Last TAC talkgroup opened at startup.
pub const TAC_TG_END: u32 = 109;

/// Keying this talkgroup unsubscribes the slot from everything.
pub const UNSUBSCRIBE_ALL_TG: u32 = 4000;

/// Nodes silent at least this long are evicted by the housekeeper.
pub const NODE_IDLE_SECS: u64 = 60;

/// One timeslot of a hotspot.
#[derive(Debug)]
pub struct Slot {
    /// Slot ID: the owning node's ID with bit 31 encoding the slot index.
    pub slotid: u32,
    /// Subscribed talkgroup, 0 when unsubscribed.
    pub tg: u32,
    /// In-progress parrot capture, if any.
    pub parrot: Option<ParrotCapture>,
    /// Bumped whenever a new parrot capture is allocated.
    pub parrot_seq: u8,
    prev: u32,
    next: u32,
}

impl Slot {
    fn new(slotid: u32) -> Self {
        Self {
            slotid,
            tg: 0,
            parrot: None,
            parrot_seq: 0,
            prev: 0,
            next: 0,
        }
    }
}

/// A hotspot known to the server.
#[derive(Debug)]
pub struct Node {
    /// Full node ID, ESSID suffix included.
    pub nodeid: u32,
    /// DMR ID without the ESSID suffix.
    pub dmrid: u32,
    /// Challenge salt generated at the last login.
    pub salt: [u8; 4],
    /// Last known peer address; locked in by authentication.
    pub addr: Option<SocketAddr>,
    /// Whether the node passed the RPTK challenge.
    pub authenticated: bool,
    /// Second the node was last heard from.
    pub last_seen_sec: u64,
    /// The node's two timeslots.
    pub slots: [Slot; 2],
}

impl Node {
    fn new(nodeid: u32) -> Self {
        let (dmrid, _essid) = ident::split(nodeid);
        Self {
            nodeid,
            dmrid,
            salt: [0; 4],
            addr: None,
            authenticated: false,
            last_seen_sec: 0,
            slots: [
                Slot::new(ident::slot_id(nodeid, 0)),
                Slot::new(ident::slot_id(nodeid, 1)),
            ],
        }
    }
}

/// A talkgroup and its subscriber list.
#[derive(Debug)]
pub struct Talkgroup {
    /// Talkgroup number.
    pub tg: u32,
    /// Slot ID of the stream owner, 0 when nobody is transmitting.
    pub owner_slotid: u32,
    /// Tick of the last frame relayed for the owner.
    pub last_packet_ms: u64,
    /// Slot ID of the first subscriber, 0 when the list is empty.
    pub head: u32,
}

impl Talkgroup {
    fn new(tg: u32) -> Self {
        Self {
            tg,
            owner_slotid: 0,
            last_packet_ms: 0,
            head: 0,
        }
    }
}

/// The node registry and talkgroup table.
pub struct State {
    nodes: HashMap<u32, Node>,
    // Last slot each radio (by DMR ID, not node ID) was heard transmitting
    // on. Private calls address radios, so this is deliberately per-dmrid:
    // nodes sharing a dmrid across ESSIDs overwrite one another's entry.
    radio_slots: HashMap<u32, u32>,
    groups: HashMap<u32, Talkgroup>,
}

impl State {
    /// Creates the state with the scanner and TAC talkgroups opened.
    pub fn new() -> Self {
        let mut state = Self {
            nodes: HashMap::new(),
            radio_slots: HashMap::new(),
            groups: HashMap::new(),
        };
        state.find_group(SCANNER_TG, true);
        for tg in TAC_TG_START..=TAC_TG_END {
            state.find_group(tg, true);
        }
        state
    }

    /// Looks up a node, optionally creating it.
    ///
    /// The slot bit of `nodeid` is ignored. Returns `None` when the DMR ID
    /// (after stripping a possible ESSID suffix) is out of range. A fresh
    /// node is unauthenticated, has no address and both slots unsubscribed.
    pub fn find_or_create_node(&mut self, nodeid: u32, create: bool) -> Option<&mut Node> {
        let nodeid = ident::node_of(nodeid);
        let (dmrid, _essid) = ident::split(nodeid);
        if !ident::dmrid_in_range(dmrid) {
            return None;
        }
        if create {
            Some(self.nodes.entry(nodeid).or_insert_with(|| Node::new(nodeid)))
        } else {
            self.nodes.get_mut(&nodeid)
        }
    }

    /// Looks up a slot, optionally creating its node.
    pub fn find_slot(&mut self, slotid: u32, create: bool) -> Option<&mut Slot> {
        let index = ident::slot_index(slotid);
        let node = self.find_or_create_node(ident::node_of(slotid), create)?;
        Some(&mut node.slots[index])
    }

    pub fn node(&self, nodeid: u32) -> Option<&Node> {
        self.nodes.get(&ident::node_of(nodeid))
    }

    pub fn slot(&self, slotid: u32) -> Option<&Slot> {
        self.node(ident::node_of(slotid))
            .map(|n| &n.slots[ident::slot_index(slotid)])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Looks up a talkgroup, optionally creating it.
    ///
    /// Returns `None` outside `[1, MAX_TALKGROUP)`. Only startup and
    /// configuration create talkgroups; the dispatcher always passes
    /// `create = false`.
    pub fn find_group(&mut self, tg: u32, create: bool) -> Option<&mut Talkgroup> {
        if !(1..MAX_TALKGROUP).contains(&tg) {
            return None;
        }
        if create {
            Some(self.groups.entry(tg).or_insert_with(|| Talkgroup::new(tg)))
        } else {
            self.groups.get_mut(&tg)
        }
    }

    pub fn group(&self, tg: u32) -> Option<&Talkgroup> {
        self.groups.get(&tg)
    }

    /// Subscribes a slot to a talkgroup.
    ///
    /// A slot subscribed elsewhere is first unsubscribed; the slot is then
    /// inserted at the head of the group's list. Subscribing to the current
    /// group is a no-op, so the operation is idempotent.
    pub fn subscribe(&mut self, slotid: u32, tg: u32) {
        let current = match self.slot(slotid) {
            Some(slot) => slot.tg,
            None => return,
        };
        if current == tg || !self.groups.contains_key(&tg) {
            return;
        }
        self.unsubscribe(slotid);
        info!("Subscribe {} to talkgroup {}", ident::display(slotid), tg);
        let old_head = match self.groups.get_mut(&tg) {
            Some(group) => {
                let old_head = group.head;
                group.head = slotid;
                old_head
            }
            None => return,
        };
        if old_head != 0 {
            if let Some(neighbor) = self.slot_mut(old_head) {
                neighbor.prev = slotid;
            }
        }
        if let Some(slot) = self.slot_mut(slotid) {
            slot.tg = tg;
            slot.prev = 0;
            slot.next = old_head;
        }
    }

    /// Unsubscribes a slot from its talkgroup, if any.
    ///
    /// Splices the slot out of the subscriber list, releases group
    /// ownership if the slot held it, and zeroes the slot's talkgroup.
    /// Idempotent: an unsubscribed slot is left untouched.
    pub fn unsubscribe(&mut self, slotid: u32) {
        let (tg, prev, next) = match self.slot_mut(slotid) {
            Some(slot) if slot.tg != 0 => {
                let links = (slot.tg, slot.prev, slot.next);
                slot.tg = 0;
                slot.prev = 0;
                slot.next = 0;
                links
            }
            _ => return,
        };
        info!("Unsubscribe {} from talkgroup {}", ident::display(slotid), tg);
        if prev != 0 {
            if let Some(neighbor) = self.slot_mut(prev) {
                neighbor.next = next;
            }
        }
        if next != 0 {
            if let Some(neighbor) = self.slot_mut(next) {
                neighbor.prev = prev;
            }
        }
        if let Some(group) = self.groups.get_mut(&tg) {
            if group.owner_slotid == slotid {
                group.owner_slotid = 0;
            }
            if group.head == slotid {
                group.head = next;
            }
        }
    }

    /// Removes a node, unsubscribing both slots first.
    pub fn delete_node(&mut self, nodeid: u32) {
        let nodeid = ident::node_of(nodeid);
        let slotids = match self.nodes.get(&nodeid) {
            Some(node) => [node.slots[0].slotid, node.slots[1].slotid],
            None => return,
        };
        info!("Delete node {}", nodeid);
        for slotid in slotids {
            self.unsubscribe(slotid);
        }
        self.nodes.remove(&nodeid);
    }

    /// Records the slot a radio was last heard transmitting on.
    pub fn record_radio_slot(&mut self, radioid: u32, slotid: u32) {
        if ident::dmrid_in_range(radioid) {
            self.radio_slots.insert(radioid, slotid);
        }
    }

    /// Slot a radio was last heard on, for private-call destination lookup.
    ///
    /// Entries may outlive the node they point at; callers must tolerate a
    /// slot that no longer resolves.
    pub fn radio_slot_of(&self, dmrid: u32) -> Option<u32> {
        self.radio_slots.get(&dmrid).copied()
    }

    pub fn radio_slots(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.radio_slots.iter().map(|(&dmrid, &slotid)| (dmrid, slotid))
    }

    /// Fan-out targets for a talkgroup: `(address, destination slotid)` of
    /// every subscriber except `exclude_slotid` (pass 0 to exclude nobody).
    ///
    /// Snapshots the list so the caller can send without holding a borrow.
    pub fn fanout_targets(&self, tg: u32, exclude_slotid: u32) -> Vec<(SocketAddr, u32)> {
        let mut targets = Vec::new();
        let mut cursor = match self.groups.get(&tg) {
            Some(group) => group.head,
            None => return targets,
        };
        while cursor != 0 {
            let slot = match self.slot(cursor) {
                Some(slot) => slot,
                None => break,
            };
            if cursor != exclude_slotid {
                if let Some(addr) = self.node(cursor).and_then(|n| n.addr) {
                    targets.push((addr, cursor));
                }
            }
            cursor = slot.next;
        }
        targets
    }

    /// Node IDs idle at least `max_idle_secs`, collected ahead of deletion
    /// so the sweep never mutates the registry mid-walk.
    pub fn idle_node_ids(&self, now_sec: u64, max_idle_secs: u64) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|node| now_sec.saturating_sub(node.last_seen_sec) >= max_idle_secs)
            .map(|node| node.nodeid)
            .collect()
    }

    fn slot_mut(&mut self, slotid: u32) -> Option<&mut Slot> {
        let index = ident::slot_index(slotid);
        self.nodes
            .get_mut(&ident::node_of(slotid))
            .map(|node| &mut node.slots[index])
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{HIGH_DMRID, LOW_DMRID};

    const NODE_A: u32 = 3_200_132;
    const NODE_B: u32 = 3_200_133;
    const NODE_C: u32 = 3_200_134;
    const TG: u32 = 3100;

    fn state_with_group() -> State {
        let mut state = State::new();
        state.find_group(TG, true);
        state
    }

    fn make_node(state: &mut State, nodeid: u32) -> u32 {
        state.find_or_create_node(nodeid, true).expect("in range");
        ident::slot_id(nodeid, 0)
    }

    /// Walks the subscriber list and checks prev/next consistency.
    fn chain(state: &State, tg: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut prev = 0;
        let mut cursor = state.group(tg).expect("group exists").head;
        while cursor != 0 {
            let slot = state.slot(cursor).expect("linked slot exists");
            assert_eq!(slot.prev, prev, "prev link of {} inconsistent", cursor);
            assert_eq!(slot.tg, tg);
            out.push(cursor);
            prev = cursor;
            cursor = slot.next;
        }
        out
    }

    #[test]
    fn test_dmrid_range_enforced() {
        let mut state = State::new();
        assert!(state.find_or_create_node(LOW_DMRID - 1, true).is_none());
        assert!(state.find_or_create_node(LOW_DMRID, true).is_some());
        assert!(state.find_or_create_node(HIGH_DMRID - 1, true).is_some());
        assert!(state.find_or_create_node(HIGH_DMRID, true).is_none());
    }

    #[test]
    fn test_essid_nodes_are_distinct() {
        let mut state = State::new();
        let plain = make_node(&mut state, NODE_A);
        let essid = make_node(&mut state, NODE_A * 100 + 7);
        assert_ne!(plain, essid);
        assert_eq!(state.node(NODE_A).unwrap().dmrid, NODE_A);
        assert_eq!(state.node(NODE_A * 100 + 7).unwrap().dmrid, NODE_A);
        assert_eq!(state.node_count(), 2);
    }

    #[test]
    fn test_fresh_node_shape() {
        let mut state = State::new();
        make_node(&mut state, NODE_A);
        let node = state.node(NODE_A).unwrap();
        assert!(!node.authenticated);
        assert!(node.addr.is_none());
        assert_eq!(node.last_seen_sec, 0);
        assert_eq!(node.slots[0].slotid, NODE_A);
        assert_eq!(node.slots[1].slotid, NODE_A | 0x8000_0000);
        assert_eq!(node.slots[0].tg, 0);
        assert_eq!(node.slots[1].tg, 0);
    }

    #[test]
    fn test_find_slot_strips_and_selects() {
        let mut state = State::new();
        let slot2 = ident::slot_id(NODE_A, 1);
        let slot = state.find_slot(slot2, true).expect("created");
        assert_eq!(slot.slotid, slot2);
        assert_eq!(state.node_count(), 1);
    }

    #[test]
    fn test_preset_groups() {
        let state = State::new();
        assert!(state.group(SCANNER_TG).is_some());
        for tg in TAC_TG_START..=TAC_TG_END {
            assert!(state.group(tg).is_some());
        }
        assert!(state.group(TG).is_none());
    }

    #[test]
    fn test_group_range() {
        let mut state = State::new();
        assert!(state.find_group(0, true).is_none());
        assert!(state.find_group(MAX_TALKGROUP, true).is_none());
        assert!(state.find_group(1, true).is_some());
        assert!(state.find_group(MAX_TALKGROUP - 1, true).is_some());
    }

    #[test]
    fn test_subscribe_inserts_at_head() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        let b = make_node(&mut state, NODE_B);
        let c = make_node(&mut state, NODE_C);
        state.subscribe(a, TG);
        assert_eq!(chain(&state, TG), vec![a]);
        state.subscribe(b, TG);
        assert_eq!(chain(&state, TG), vec![b, a]);
        state.subscribe(c, TG);
        assert_eq!(chain(&state, TG), vec![c, b, a]);
        assert_eq!(state.group(TG).unwrap().head, c);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        state.subscribe(a, TG);
        state.subscribe(a, TG);
        assert_eq!(chain(&state, TG), vec![a]);
    }

    #[test]
    fn test_subscribe_moves_between_groups() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        state.subscribe(a, TG);
        state.subscribe(a, TAC_TG_START);
        assert_eq!(chain(&state, TG), Vec::<u32>::new());
        assert_eq!(chain(&state, TAC_TG_START), vec![a]);
        assert_eq!(state.slot(a).unwrap().tg, TAC_TG_START);
    }

    #[test]
    fn test_unsubscribe_middle_of_chain() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        let b = make_node(&mut state, NODE_B);
        let c = make_node(&mut state, NODE_C);
        state.subscribe(a, TG);
        state.subscribe(b, TG);
        state.subscribe(c, TG);
        // chain is c, b, a; remove the middle
        state.unsubscribe(b);
        assert_eq!(chain(&state, TG), vec![c, a]);
        let slot = state.slot(b).unwrap();
        assert_eq!(slot.tg, 0);
        assert_eq!(slot.prev, 0);
        assert_eq!(slot.next, 0);
    }

    #[test]
    fn test_unsubscribe_head_and_tail() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        let b = make_node(&mut state, NODE_B);
        state.subscribe(a, TG);
        state.subscribe(b, TG);
        state.unsubscribe(b); // head
        assert_eq!(chain(&state, TG), vec![a]);
        state.unsubscribe(a); // tail, now sole entry
        assert_eq!(chain(&state, TG), Vec::<u32>::new());
        assert_eq!(state.group(TG).unwrap().head, 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        state.subscribe(a, TG);
        state.unsubscribe(a);
        state.unsubscribe(a);
        assert_eq!(state.slot(a).unwrap().tg, 0);
        assert_eq!(chain(&state, TG), Vec::<u32>::new());
    }

    #[test]
    fn test_unsubscribe_releases_ownership() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        state.subscribe(a, TG);
        state.find_group(TG, false).unwrap().owner_slotid = a;
        state.unsubscribe(a);
        assert_eq!(state.group(TG).unwrap().owner_slotid, 0);
    }

    #[test]
    fn test_delete_node_cascades() {
        let mut state = state_with_group();
        let a1 = make_node(&mut state, NODE_A);
        let a2 = ident::slot_id(NODE_A, 1);
        let b = make_node(&mut state, NODE_B);
        state.subscribe(a1, TG);
        state.subscribe(b, TG);
        state.subscribe(a2, TAC_TG_START);
        state.delete_node(NODE_A);
        assert!(state.node(NODE_A).is_none());
        assert_eq!(chain(&state, TG), vec![b]);
        assert_eq!(chain(&state, TAC_TG_START), Vec::<u32>::new());
    }

    #[test]
    fn test_delete_missing_node_is_noop() {
        let mut state = State::new();
        state.delete_node(NODE_A);
        assert_eq!(state.node_count(), 0);
    }

    #[test]
    fn test_radio_slots() {
        let mut state = State::new();
        let a2 = ident::slot_id(NODE_A, 1);
        state.record_radio_slot(NODE_A, a2);
        assert_eq!(state.radio_slot_of(NODE_A), Some(a2));
        // re-recording overwrites
        state.record_radio_slot(NODE_A, NODE_A);
        assert_eq!(state.radio_slot_of(NODE_A), Some(NODE_A));
        // out-of-range radio IDs are ignored
        state.record_radio_slot(HIGH_DMRID, NODE_A);
        assert_eq!(state.radio_slot_of(HIGH_DMRID), None);
    }

    #[test]
    fn test_fanout_targets_exclude_sender() {
        let mut state = state_with_group();
        let a = make_node(&mut state, NODE_A);
        let b = make_node(&mut state, NODE_B);
        let addr_a: SocketAddr = "10.0.0.1:62031".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:62031".parse().unwrap();
        state.find_or_create_node(NODE_A, false).unwrap().addr = Some(addr_a);
        state.find_or_create_node(NODE_B, false).unwrap().addr = Some(addr_b);
        state.subscribe(a, TG);
        state.subscribe(b, TG);
        let targets = state.fanout_targets(TG, a);
        assert_eq!(targets, vec![(addr_b, b)]);
        // exclusion of 0 keeps everyone
        let all = state.fanout_targets(TG, 0);
        assert_eq!(all, vec![(addr_b, b), (addr_a, a)]);
    }

    #[test]
    fn test_idle_node_ids() {
        let mut state = State::new();
        make_node(&mut state, NODE_A);
        make_node(&mut state, NODE_B);
        state.find_or_create_node(NODE_A, false).unwrap().last_seen_sec = 100;
        state.find_or_create_node(NODE_B, false).unwrap().last_seen_sec = 50;
        let mut idle = state.idle_node_ids(110, NODE_IDLE_SECS);
        idle.sort_unstable();
        assert_eq!(idle, vec![NODE_B]);
        let mut idle = state.idle_node_ids(160, NODE_IDLE_SECS);
        idle.sort_unstable();
        assert_eq!(idle, vec![NODE_A, NODE_B]);
    }
}
