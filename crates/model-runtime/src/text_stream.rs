// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Incremental cleanup of raw backend output.
//!
//! Backends print generated text in arbitrary fragments: a fragment may end in
//! the middle of a word, or in the middle of a delimiter such as `[/INST]`.
//! [`TextStream`] buffers fragments and only ever emits complete tokens, so
//! the sequence of increments a consumer sees does not depend on how the
//! backend happened to flush its stdout.
//!
//! Once the earliest configured stop marker shows up in the buffered text,
//! everything before it is emitted and the stream stops for good; the marker
//! and anything after it are trailer noise.

/// How raw text is cut into emit-able tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Tokens are maximal runs of non-whitespace characters.
    Whitespace,
}

impl SplitPolicy {
    fn is_boundary(&self, c: char) -> bool {
        match self {
            SplitPolicy::Whitespace => c.is_whitespace(),
        }
    }

    /// Byte offset just past the last boundary in `text`, or 0 if there is
    /// none. Everything before the offset consists of complete tokens.
    fn complete_prefix_len(&self, text: &str) -> usize {
        text.char_indices()
            .rev()
            .find(|(_, c)| self.is_boundary(*c))
            .map(|(idx, c)| idx + c.len_utf8())
            .unwrap_or(0)
    }

    fn tokens(&self, text: &str) -> Vec<String> {
        text.split(|c: char| self.is_boundary(c))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Per-model stream policy returned by [`crate::Model::text_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextStreamConfig {
    pub split: SplitPolicy,
    /// Markers that end the clean portion of the output, in priority order.
    pub stop_markers: Vec<String>,
}

impl TextStreamConfig {
    pub fn new<I, S>(split: SplitPolicy, stop_markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            split,
            stop_markers: stop_markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// A stop marker was seen; no further output.
    Stopped,
    /// [`TextStream::close`] was called.
    Closed,
}

/// Stateful filter turning raw fragments into clean token increments.
///
/// Single use: a new task gets a new stream.
#[derive(Debug)]
pub struct TextStream {
    config: TextStreamConfig,
    buffer: String,
    state: StreamState,
}

impl TextStream {
    pub fn new(config: TextStreamConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            state: StreamState::Open,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Feed one raw fragment and return the increments it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        if !self.is_open() || chunk.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(chunk);

        if let Some(pos) = self.earliest_stop_marker() {
            self.buffer.truncate(pos);
            let out = self.config.split.tokens(&self.buffer);
            self.buffer.clear();
            self.state = StreamState::Stopped;
            return out;
        }

        // a marker may still be arriving: never emit past the start of a
        // buffered suffix that could grow into one.
        let limit = self.partial_marker_start().unwrap_or(self.buffer.len());
        let end = self.config.split.complete_prefix_len(&self.buffer[..limit]);
        if end == 0 {
            return Vec::new();
        }
        let ready: String = self.buffer.drain(..end).collect();
        self.config.split.tokens(&ready)
    }

    /// Flush whatever partial token is left. Idempotent.
    pub fn close(&mut self) -> Vec<String> {
        if !self.is_open() {
            return Vec::new();
        }
        self.state = StreamState::Closed;
        let rest = std::mem::take(&mut self.buffer);
        self.config.split.tokens(&rest)
    }

    /// Position of the earliest configured marker in the buffer. Ties go to
    /// the marker listed first.
    fn earliest_stop_marker(&self) -> Option<usize> {
        self.config
            .stop_markers
            .iter()
            .filter_map(|marker| self.buffer.find(marker.as_str()))
            .min()
    }

    /// Start of the longest buffer suffix that is a proper prefix of a marker.
    fn partial_marker_start(&self) -> Option<usize> {
        self.buffer
            .char_indices()
            .map(|(idx, _)| idx)
            .find(|&idx| {
                let suffix = &self.buffer[idx..];
                self.config
                    .stop_markers
                    .iter()
                    .any(|marker| marker.len() > suffix.len() && marker.starts_with(suffix))
            })
    }
}
