/// Near-bottom distance used to resume follow mode.
const AUTO_FOLLOW_RESUME_THRESHOLD_PX: f32 = 24.0;
/// Small delta used to ignore floating-point scroll jitter.
const SCROLL_DELTA_EPSILON: f32 = 1.0;

/// Scroll geometry in pixels. `offset_y` grows downward from the top of the content.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMetrics {
    pub offset_y: f32,
    pub content_height: f32,
    pub viewport_height: f32,
}

impl ViewportMetrics {
    pub fn max_offset(&self) -> f32 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    fn distance_to_bottom(&self) -> f32 {
        (self.max_offset() - self.offset_y).abs()
    }
}

/// Host scroll container.
pub trait Viewport {
    fn metrics(&self) -> ViewportMetrics;
    fn set_offset(&mut self, offset_y: f32);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SentinelDecision {
    /// Start an older-page load now.
    LoadOlder,
    OutsideMargin,
    NoMoreHistory,
    LoadInFlight,
    RestorePending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RestoreAnchor {
    content_height: f32,
    offset_y: f32,
}

/// Keeps the visible content still while older history is prepended, and
/// follows the tail while the newest message grows.
#[derive(Debug, Clone)]
pub struct ScrollAnchor {
    pre_trigger_margin_px: f32,
    pending_restore: Option<RestoreAnchor>,
    pending_scroll_to_bottom: bool,
    follow_bottom: bool,
    last_metrics: ViewportMetrics,
}

impl ScrollAnchor {
    pub fn new(pre_trigger_margin_px: f32) -> Self {
        Self {
            pre_trigger_margin_px,
            pending_restore: None,
            pending_scroll_to_bottom: false,
            follow_bottom: true,
            last_metrics: ViewportMetrics::default(),
        }
    }

    pub fn is_restore_pending(&self) -> bool {
        self.pending_restore.is_some()
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    /// Observer callback for the top-of-list sentinel.
    ///
    /// `distance_px` is how far the sentinel is from entering the viewport
    /// (zero or negative once visible). On `LoadOlder` the current geometry
    /// is captured so the offset can be corrected after the prepend.
    pub fn on_sentinel(
        &mut self,
        distance_px: f32,
        has_more: bool,
        load_in_flight: bool,
        viewport: &impl Viewport,
    ) -> SentinelDecision {
        if self.pending_restore.is_some() {
            return SentinelDecision::RestorePending;
        }
        if distance_px > self.pre_trigger_margin_px {
            return SentinelDecision::OutsideMargin;
        }
        if !has_more {
            return SentinelDecision::NoMoreHistory;
        }
        if load_in_flight {
            return SentinelDecision::LoadInFlight;
        }

        let metrics = viewport.metrics();
        self.pending_restore = Some(RestoreAnchor {
            content_height: metrics.content_height,
            offset_y: metrics.offset_y,
        });
        tracing::trace!(
            content_height = metrics.content_height,
            offset_y = metrics.offset_y,
            "captured scroll anchor before older load"
        );
        SentinelDecision::LoadOlder
    }

    /// Call from the layout commit of the frame that rendered a prepend.
    ///
    /// Shifts the offset by the content-height delta and returns the applied
    /// shift. Does nothing when no restore is pending.
    pub fn on_layout_committed(&mut self, viewport: &mut impl Viewport) -> Option<f32> {
        let anchor = self.pending_restore.take()?;
        let metrics = viewport.metrics();
        let delta = metrics.content_height - anchor.content_height;
        if delta.abs() <= SCROLL_DELTA_EPSILON {
            self.last_metrics = metrics;
            return None;
        }

        let offset_y = anchor.offset_y + delta;
        viewport.set_offset(offset_y);
        self.last_metrics = ViewportMetrics { offset_y, ..metrics };
        Some(delta)
    }

    /// The load resolved without adding anything; release the anchor.
    pub fn abandon_restore(&mut self) {
        self.pending_restore = None;
    }

    pub fn request_scroll_to_bottom(&mut self) {
        self.pending_scroll_to_bottom = true;
        self.follow_bottom = true;
    }

    pub fn reset(&mut self) {
        self.pending_restore = None;
        self.last_metrics = ViewportMetrics::default();
        self.follow_bottom = true;
        self.pending_scroll_to_bottom = true;
    }

    pub fn update_follow_state(&mut self, viewport: &impl Viewport) {
        let metrics = viewport.metrics();
        let offset_delta = metrics.offset_y - self.last_metrics.offset_y;
        let max_delta = (metrics.max_offset() - self.last_metrics.max_offset()).abs();
        let content_size_changed = max_delta > SCROLL_DELTA_EPSILON;
        let user_scrolled_up = offset_delta < -SCROLL_DELTA_EPSILON && !content_size_changed;
        let user_scrolled_down = offset_delta > SCROLL_DELTA_EPSILON && !content_size_changed;
        let was_near_bottom =
            self.last_metrics.distance_to_bottom() <= AUTO_FOLLOW_RESUME_THRESHOLD_PX;

        if self.pending_scroll_to_bottom || (content_size_changed && was_near_bottom) {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            if user_scrolled_up {
                self.follow_bottom = false;
            }
        } else if user_scrolled_down
            && metrics.distance_to_bottom() <= AUTO_FOLLOW_RESUME_THRESHOLD_PX
        {
            self.follow_bottom = true;
        }

        self.last_metrics = metrics;
    }

    /// Scrolls to the tail when following. Never runs while a restore is pending.
    pub fn apply_pending_scroll(&mut self, viewport: &mut impl Viewport) -> bool {
        if self.pending_restore.is_some() {
            return false;
        }
        let should_scroll = self.follow_bottom || self.pending_scroll_to_bottom;
        if should_scroll {
            let max_offset = viewport.metrics().max_offset();
            viewport.set_offset(max_offset);
            self.last_metrics.offset_y = max_offset;
        }

        self.pending_scroll_to_bottom = false;
        should_scroll
    }
}
