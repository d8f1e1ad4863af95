//! Render-time presentation of a store snapshot.
//!
//! Search, sorting and formatting are applied to a [`StoreState`] each time it
//! is drawn, so they never discard history. The one exception is
//! [`ExclusionBar`], which pushes its filter into the store.

use chrono::{DateTime, Utc};

use crate::{ActiveFilter, CapturedEvent, EventStore, FilterError, FilterInput, StoreState};

/// Order in which buffered events are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::NewestFirst => Self::OldestFirst,
            Self::OldestFirst => Self::NewestFirst,
        }
    }
}

/// A filter bar: open/closed state, the text being edited, and the last
/// filter that compiled.
#[derive(Debug, Clone, Default)]
pub struct FilterBar {
    open: bool,
    input: FilterInput,
    filter: ActiveFilter,
    error: Option<String>,
}

impl FilterBar {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub const fn input(&self) -> &FilterInput {
        &self.input
    }

    #[must_use]
    pub const fn filter(&self) -> &ActiveFilter {
        &self.filter
    }

    /// Message from the last edit that failed to compile.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Show or hide the bar. Hiding it discards the input and the filter.
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
        if !open {
            self.input = FilterInput::default();
            self.filter = ActiveFilter::Off;
            self.error = None;
        }
    }

    /// Apply an edit and recompile.
    ///
    /// If the result does not compile the previous filter stays in effect.
    ///
    /// # Errors
    /// Returns the compilation error after recording it.
    pub fn edit(&mut self, edit: impl FnOnce(&mut FilterInput)) -> Result<&ActiveFilter, FilterError> {
        edit(&mut self.input);
        match self.input.compile() {
            Ok(filter) => {
                self.filter = filter;
                self.error = None;
                Ok(&self.filter)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Filter did not compile, keeping previous one");
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

/// Filter bar that drives a store's exclusion filter.
///
/// Every successful edit replaces the store's filter; closing the bar turns
/// exclusion off again. A failed edit leaves the store alone.
#[derive(Debug, Clone, Default)]
pub struct ExclusionBar {
    bar: FilterBar,
}

impl ExclusionBar {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.bar.is_open()
    }

    #[must_use]
    pub const fn input(&self) -> &FilterInput {
        self.bar.input()
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.bar.error()
    }

    /// Show or hide the bar. Hiding it clears the store's exclusion filter.
    pub fn set_open(&mut self, store: &EventStore, open: bool) {
        self.bar.set_open(open);
        if !open {
            store.set_exclusion_filter(ActiveFilter::Off);
        }
    }

    /// Apply an edit and hand the recompiled filter to `store`.
    ///
    /// # Errors
    /// Returns the compilation error; the store keeps its current filter.
    pub fn edit(
        &mut self,
        store: &EventStore,
        edit: impl FnOnce(&mut FilterInput),
    ) -> Result<(), FilterError> {
        let filter = self.bar.edit(edit)?.clone();
        store.set_exclusion_filter(filter);
        Ok(())
    }
}

/// One event formatted for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEvent {
    pub header: String,
    pub route: String,
    pub body: String,
}

/// Presentation settings for the event list.
#[derive(Debug, Clone)]
pub struct LogView {
    pub sort: SortOrder,
    pub prettify: bool,
    pub search: FilterBar,
    pub exclusion: ExclusionBar,
}

impl Default for LogView {
    fn default() -> Self {
        Self {
            sort: SortOrder::default(),
            prettify: true,
            search: FilterBar::default(),
            exclusion: ExclusionBar::default(),
        }
    }
}

impl LogView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn toggle_sort(&mut self) {
        self.sort = self.sort.toggled();
    }

    pub const fn toggle_prettify(&mut self) {
        self.prettify = !self.prettify;
    }

    /// True iff any search field has text, whether or not it compiled.
    #[must_use]
    pub fn has_search(&self) -> bool {
        self.search.input().is_active()
    }

    /// Events that pass the search filter, in display order.
    #[must_use]
    pub fn visible<'a>(&self, state: &'a StoreState) -> Vec<&'a CapturedEvent> {
        let search = self.search.filter();
        let mut events: Vec<&CapturedEvent> = state.iter().filter(|e| search.includes(e)).collect();

        events.sort_by(|a, b| match self.sort {
            SortOrder::OldestFirst => a.timestamp.total_cmp(&b.timestamp),
            SortOrder::NewestFirst => b.timestamp.total_cmp(&a.timestamp),
        });
        events
    }

    /// Message count line shown above the list.
    #[must_use]
    pub fn summary(&self, state: &StoreState) -> String {
        if self.has_search() {
            format!("{} matching ({} total)", self.visible(state).len(), state.len())
        } else {
            format!("{} messages", state.len())
        }
    }

    /// Payload as JSON, indented when prettify is on.
    #[must_use]
    pub fn format_data(&self, event: &CapturedEvent) -> String {
        if self.prettify {
            format!("{:#}", event.data)
        } else {
            event.data.to_string()
        }
    }

    /// Formatted list for the current snapshot.
    #[must_use]
    pub fn render(&self, state: &StoreState) -> Vec<RenderedEvent> {
        self.visible(state)
            .into_iter()
            .map(|event| RenderedEvent {
                header: format_header(event),
                route: format_route(event),
                body: self.format_data(event),
            })
            .collect()
    }
}

/// `YYYY-MM-DD HH:mm:ss (+Nms)` from the capture time and page-relative time.
#[must_use]
pub fn format_header(event: &CapturedEvent) -> String {
    #[allow(clippy::cast_possible_truncation)]
    let millis = event.datetime as i64;
    let when = DateTime::<Utc>::from_timestamp_millis(millis).map_or_else(
        || "????-??-?? ??:??:??".to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    format!("{when} (+{}ms)", event.timestamp.round())
}

/// `origin → destination`.
#[must_use]
pub fn format_route(event: &CapturedEvent) -> String {
    format!("{} \u{2192} {}", event.origin, event.destination)
}
