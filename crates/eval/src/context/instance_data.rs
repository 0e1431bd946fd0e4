//! Instance buffer layout for the frames a transition enters.
//!
//! The buffer holds, per frame, the global instances (evaluators, then
//! global tasks) for global frames followed by one block per active state:
//! parameters, the captured event when the state requires one, then its
//! tasks. The prefix shared with the active frames is kept in place.

use statetree_core::{AssetId, DataHandle, InstanceStruct};

use super::ExecutionContext;
use crate::events::{SelectionEvents, SharedEvent};
use crate::frame::{ExecutionFrame, FrameId};
use crate::storage::InstanceSlot;

enum SlotInit<'t> {
    Data(&'t InstanceStruct),
    Event,
}

struct PlannedSlot<'t> {
    frame_id: FrameId,
    handle: DataHandle,
    init: SlotInit<'t>,
}

impl<'a> ExecutionContext<'a> {
    /// Rebuilds the instance buffer for `next` and sets its instance bases.
    /// Data of newly selected states moves in from the temporaries created
    /// during selection; anything else starts from its template.
    pub(crate) fn update_instance_data(&mut self, next: &mut [ExecutionFrame]) {
        let mut plan: Vec<PlannedSlot<'a>> = Vec::new();
        let mut global_bases: Vec<(AssetId, usize)> = Vec::new();
        let mut kept = 0;
        let mut are_common = true;

        for (frame_index, frame) in next.iter_mut().enumerate() {
            let Some(tree) = self.tree(frame.tree) else {
                are_common = false;
                continue;
            };
            let current_states = self
                .storage
                .exec
                .active_frames
                .get(frame_index)
                .filter(|current| current.is_same_frame(frame))
                .map(|current| current.active_states);
            are_common &= current_states.is_some();

            if frame.is_global_frame {
                let base = plan.len();
                for node_index in tree.evaluators.range().chain(tree.global_tasks.range()) {
                    let Some(node) = tree.node(node_index) else {
                        continue;
                    };
                    plan.push(PlannedSlot {
                        frame_id: frame.frame_id,
                        handle: node.instance,
                        init: SlotInit::Data(&node.template),
                    });
                }
                global_bases.push((frame.tree, base));
                if are_common {
                    kept = plan.len();
                }
            }
            frame.global_instance_base = global_bases
                .iter()
                .rev()
                .find(|(asset, _)| *asset == frame.tree)
                .map(|(_, base)| *base);

            frame.active_instance_base = Some(plan.len());
            for (state_index, &handle) in frame.active_states.handles().iter().enumerate() {
                let Some(state) = tree.state(handle) else {
                    are_common = false;
                    continue;
                };
                are_common &= current_states.is_some_and(|states| states.get(state_index) == handle);

                plan.push(PlannedSlot {
                    frame_id: frame.frame_id,
                    handle: state.parameter_handle,
                    init: SlotInit::Data(&state.parameter_template),
                });
                if state.required_event.is_some() {
                    plan.push(PlannedSlot {
                        frame_id: frame.frame_id,
                        handle: state.event_handle,
                        init: SlotInit::Event,
                    });
                }
                for (_, node) in tree.task_nodes(state.tasks) {
                    plan.push(PlannedSlot {
                        frame_id: frame.frame_id,
                        handle: node.instance,
                        init: SlotInit::Data(&node.template),
                    });
                }
                if are_common {
                    kept = plan.len();
                }
            }
        }

        let kept = kept.min(self.storage.instances.len());
        self.storage.instances.truncate(kept);
        for slot in plan.into_iter().skip(kept) {
            let data = self
                .storage
                .take_temporary(slot.frame_id, slot.handle)
                .unwrap_or_else(|| match slot.init {
                    SlotInit::Data(template) => InstanceSlot::Data(template.clone()),
                    SlotInit::Event => InstanceSlot::Event(None),
                });
            self.storage.instances.push(data);
        }
        tracing::trace!(instances = self.storage.instances.len(), kept, "instance data updated");
        self.storage.temporaries.clear();
    }

    /// Stores the events captured during selection into the event slots of
    /// the states `next` enters. An event already held elsewhere (a delayed
    /// transition or another state) is copied so each holder owns its own.
    pub(crate) fn capture_new_state_events(
        &mut self,
        previous: &[ExecutionFrame],
        next: &[ExecutionFrame],
        events: &[SelectionEvents],
    ) {
        let mut in_use: Vec<SharedEvent> = self
            .storage
            .exec
            .delayed_transitions
            .iter()
            .filter_map(|delayed| delayed.captured_event.clone())
            .collect();

        for (frame_index, frame) in next.iter().enumerate() {
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            let Some(base) = frame.active_instance_base else {
                continue;
            };
            let len = frame.active_states.len();
            let first_new = match previous.get(frame_index).filter(|p| p.frame_id == frame.frame_id) {
                Some(prev) => (0..len)
                    .find(|&i| prev.active_states.id(i) != frame.active_states.id(i))
                    .unwrap_or(len),
                None => 0,
            };

            for state_index in first_new..len {
                let Some(state) = tree.state(frame.active_states.get(state_index)) else {
                    continue;
                };
                if state.required_event.is_none() || !state.event_handle.is_valid() {
                    continue;
                }
                let captured = events
                    .get(frame_index)
                    .and_then(|frame_events| frame_events.get(state_index))
                    .map(|event| {
                        if in_use.iter().any(|held| held.ptr_eq(event)) {
                            event.deep_copy()
                        } else {
                            in_use.push(event.clone());
                            event.clone()
                        }
                    });
                if let Some(slot) = self
                    .storage
                    .instances
                    .get_mut(base + state.event_handle.index as usize)
                {
                    *slot = InstanceSlot::Event(captured);
                }
            }
        }
    }
}
