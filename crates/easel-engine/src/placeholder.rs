use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use easel_contracts::events::CanvasEventSink;
use easel_contracts::layout::{placeholder_id_for, PlaceholderSpec, Point, Rect};
use easel_contracts::{Axis, RequestKind};
use indexmap::IndexMap;

use crate::config::LayoutConfig;

/// Row slot of a parallel sibling.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSlot {
    pub group_id: String,
    pub index: u32,
    pub total: u32,
    pub anchor: Point,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub message_id: String,
    pub session_id: Option<String>,
    pub kind: RequestKind,
    pub width: f64,
    pub height: f64,
    pub cached_bounds: Option<Rect>,
    pub group: Option<GroupSlot>,
}

/// A whole parallel cohort, one message id per sibling in index order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlacement {
    pub group_id: String,
    pub session_id: Option<String>,
    pub kind: RequestKind,
    pub width: f64,
    pub height: f64,
    pub cached_bounds: Option<Rect>,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    session_id: Option<String>,
    spec: PlaceholderSpec,
}

#[derive(Debug, Default)]
struct BridgeState {
    pending: IndexMap<String, Slot>,
    held: IndexMap<String, Slot>,
    placed: IndexMap<Option<String>, IndexMap<String, Rect>>,
    viewport_center: Option<Point>,
}

impl BridgeState {
    fn occupied(&self, session_id: Option<&str>, candidate: &Rect, ignore: Option<&str>) -> bool {
        let in_flight = self
            .pending
            .iter()
            .chain(self.held.iter())
            .filter(|(id, slot)| {
                Some(id.as_str()) != ignore && slot.session_id.as_deref() == session_id
            })
            .map(|(_, slot)| slot.spec.rect());
        let placed = self
            .placed
            .get(&session_id.map(str::to_string))
            .into_iter()
            .flat_map(|rects| rects.values().copied());
        placed.chain(in_flight).any(|rect| rect.intersects(candidate))
    }
}

/// Speculative layout and the show/remove protocol towards the canvas.
///
/// Pending placeholders, held cohort rows and placed assets of the same
/// session all count as occupied, so two in-flight requests never predict
/// the same cell.
pub struct PlaceholderBridge {
    sink: Arc<dyn CanvasEventSink>,
    layout: LayoutConfig,
    state: Mutex<BridgeState>,
}

impl PlaceholderBridge {
    pub fn new(sink: Arc<dyn CanvasEventSink>, layout: LayoutConfig) -> Self {
        Self {
            sink,
            layout,
            state: Mutex::new(BridgeState::default()),
        }
    }

    pub fn set_viewport_center(&self, center: Option<Point>) {
        self.lock().viewport_center = center;
    }

    /// Records an asset the canvas already shows so predictions avoid it.
    pub fn register_placed(&self, session_id: Option<&str>, id: &str, rect: Rect) {
        self.lock()
            .placed
            .entry(session_id.map(str::to_string))
            .or_default()
            .insert(id.to_string(), rect);
    }

    /// Drops the footprints of a session that no longer exists.
    pub fn forget_session(&self, session_id: &str) {
        let mut state = self.lock();
        state.placed.shift_remove(&Some(session_id.to_string()));
        state
            .held
            .retain(|_, slot| slot.session_id.as_deref() != Some(session_id));
    }

    pub fn is_pending(&self, placeholder_id: &str) -> bool {
        self.lock().pending.contains_key(placeholder_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Where a request would like to land before collision checks: next to
    /// the cached subject (below for generation, right of it for
    /// edit/blend), else the viewport center, else the origin.
    fn desired_center_with(
        &self,
        viewport: Option<Point>,
        kind: RequestKind,
        width: f64,
        height: f64,
        cached_bounds: Option<Rect>,
    ) -> Point {
        let spacing = self.layout.spacing;
        match cached_bounds {
            Some(bounds) => match kind.collision_axis() {
                Axis::Horizontal => {
                    Point::new(bounds.right() + spacing + width / 2.0, bounds.center().y)
                }
                Axis::Vertical => {
                    Point::new(bounds.center().x, bounds.bottom() + spacing + height / 2.0)
                }
            },
            None => viewport.unwrap_or_default(),
        }
    }

    /// Finds a free row for the whole cohort and holds every sibling's
    /// cell until that sibling shows it. Returns the shared anchor (center
    /// of sibling 0).
    pub fn hold_group(&self, placement: &GroupPlacement) -> Point {
        let (width, height) = (placement.width, placement.height);
        let total = u32::try_from(placement.message_ids.len()).unwrap_or(u32::MAX);
        let mut state = self.lock();
        let desired = self.desired_center_with(
            state.viewport_center,
            placement.kind,
            width,
            height,
            placement.cached_bounds,
        );
        let row_width = self.row_width(width, total);
        let footprint = |center: Point| {
            Rect::new(center.x - width / 2.0, center.y - height / 2.0, row_width, height)
        };
        let anchor = self.avoid_collisions(
            &state,
            placement.session_id.as_deref(),
            desired,
            placement.kind.collision_axis(),
            row_width,
            height,
            footprint,
            None,
        );
        for (index, message_id) in (0..total).zip(&placement.message_ids) {
            let slot = GroupSlot {
                group_id: placement.group_id.clone(),
                index,
                total,
                anchor,
            };
            let spec = self.slot_spec(message_id, placement.kind, width, height, &slot);
            state.held.insert(
                spec.placeholder_id.clone(),
                Slot {
                    session_id: placement.session_id.clone(),
                    spec,
                },
            );
        }
        tracing::debug!(
            target: "placeholder",
            group_id = %placement.group_id,
            total,
            x = anchor.x,
            y = anchor.y,
            "cohort row held"
        );
        anchor
    }

    /// Final spec for a request: group slot position, or desired position
    /// moved along the operation's axis until free.
    pub fn predict(&self, request: &PlacementRequest) -> PlaceholderSpec {
        let state = self.lock();
        self.predict_locked(&state, request)
    }

    /// Predicts and shows in one step so concurrent reservations see each
    /// other. A held cohort cell turns into the shown placeholder.
    pub fn reserve(&self, request: &PlacementRequest) -> PlaceholderSpec {
        let spec = {
            let mut state = self.lock();
            let placeholder_id = placeholder_id_for(&request.message_id);
            let spec = match state.held.shift_remove(&placeholder_id) {
                Some(held) => held.spec,
                None => self.predict_locked(&state, request),
            };
            let replaced = state
                .pending
                .insert(
                    spec.placeholder_id.clone(),
                    Slot {
                        session_id: request.session_id.clone(),
                        spec: spec.clone(),
                    },
                )
                .is_some();
            if replaced {
                self.sink.remove_placeholder(&spec.placeholder_id);
            }
            spec
        };
        self.sink.show_placeholder(&spec);
        tracing::debug!(
            target: "placeholder",
            placeholder_id = %spec.placeholder_id,
            x = spec.center.x,
            y = spec.center.y,
            "placeholder reserved"
        );
        spec
    }

    /// Showing an id that is already pending removes and recreates it.
    pub fn show(&self, spec: PlaceholderSpec) {
        let replaced = {
            let mut state = self.lock();
            let session_id = state
                .pending
                .get(&spec.placeholder_id)
                .and_then(|slot| slot.session_id.clone());
            state
                .pending
                .insert(
                    spec.placeholder_id.clone(),
                    Slot {
                        session_id,
                        spec: spec.clone(),
                    },
                )
                .is_some()
        };
        if replaced {
            self.sink.remove_placeholder(&spec.placeholder_id);
        }
        self.sink.show_placeholder(&spec);
    }

    /// Removes a pending placeholder; unknown ids are ignored so every
    /// shown placeholder is removed exactly once. A held cell that was
    /// never shown is released silently.
    pub fn remove(&self, placeholder_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            state.held.shift_remove(placeholder_id);
            state.pending.shift_remove(placeholder_id).is_some()
        };
        if removed {
            self.sink.remove_placeholder(placeholder_id);
        }
        removed
    }

    /// Removes the placeholder and keeps its footprint as a placed asset of
    /// its session.
    pub fn settle(&self, placeholder_id: &str) -> Option<Rect> {
        let rect = {
            let mut state = self.lock();
            state.held.shift_remove(placeholder_id);
            let slot = state.pending.shift_remove(placeholder_id)?;
            let rect = slot.spec.rect();
            state
                .placed
                .entry(slot.session_id)
                .or_default()
                .insert(placeholder_id.to_string(), rect);
            rect
        };
        self.sink.remove_placeholder(placeholder_id);
        Some(rect)
    }

    fn predict_locked(&self, state: &BridgeState, request: &PlacementRequest) -> PlaceholderSpec {
        if let Some(slot) = &request.group {
            return self.slot_spec(
                &request.message_id,
                request.kind,
                request.width,
                request.height,
                slot,
            );
        }
        let placeholder_id = placeholder_id_for(&request.message_id);
        let desired = self.desired_center_with(
            state.viewport_center,
            request.kind,
            request.width,
            request.height,
            request.cached_bounds,
        );
        let (width, height) = (request.width, request.height);
        let center = self.avoid_collisions(
            state,
            request.session_id.as_deref(),
            desired,
            request.kind.collision_axis(),
            width,
            height,
            |center| Rect::centered(center, width, height),
            Some(&placeholder_id),
        );
        PlaceholderSpec {
            placeholder_id,
            center,
            width,
            height,
            operation: request.kind,
            group_id: None,
            group_index: None,
            group_total: None,
            anchor: None,
        }
    }

    fn slot_spec(
        &self,
        message_id: &str,
        kind: RequestKind,
        width: f64,
        height: f64,
        slot: &GroupSlot,
    ) -> PlaceholderSpec {
        let step = width + self.layout.group_spacing;
        PlaceholderSpec {
            placeholder_id: placeholder_id_for(message_id),
            center: slot.anchor.offset(f64::from(slot.index) * step, 0.0),
            width,
            height,
            operation: kind,
            group_id: Some(slot.group_id.clone()),
            group_index: Some(slot.index),
            group_total: Some(slot.total),
            anchor: Some(slot.anchor),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn avoid_collisions<F>(
        &self,
        state: &BridgeState,
        session_id: Option<&str>,
        desired: Point,
        axis: Axis,
        width: f64,
        height: f64,
        footprint: F,
        ignore: Option<&str>,
    ) -> Point
    where
        F: Fn(Point) -> Rect,
    {
        let (dx, dy) = match axis {
            Axis::Horizontal => (width + self.layout.spacing, 0.0),
            Axis::Vertical => (0.0, height + self.layout.spacing),
        };
        let attempts = self.layout.max_collision_attempts.max(1);
        let mut center = desired;
        for attempt in 0..attempts {
            if !state.occupied(session_id, &footprint(center), ignore) {
                return center;
            }
            if attempt + 1 == attempts {
                break;
            }
            center = center.offset(dx, dy);
        }
        tracing::debug!(
            target: "placeholder",
            attempts,
            "no free slot found; accepting last position"
        );
        center
    }

    fn row_width(&self, width: f64, total: u32) -> f64 {
        let total = f64::from(total.max(1));
        total * width + (total - 1.0) * self.layout.group_spacing
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
