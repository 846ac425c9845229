/// Answer text collected from stream chunks.
///
/// Chunks are appended as deltas, except that a chunk starting with everything
/// accumulated so far is taken as cumulative text and replaces it. Replaying
/// the same cumulative text is therefore a no-op.
///
/// The backend does not say which mode it streams in, so a delta that happens
/// to repeat the whole answer so far (`"ha"`, `"ha"`) is collapsed and the
/// text stays `"ha"`.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    text: String,
}

impl Accumulator {
    /// Folds one chunk in and returns whether the text changed.
    pub fn fold(&mut self, chunk: &str) -> bool {
        if chunk.is_empty() {
            return false;
        }
        if !self.text.is_empty() && chunk.starts_with(self.text.as_str()) {
            if chunk.len() == self.text.len() {
                return false;
            }
            self.text.replace_range(.., chunk);
        } else {
            self.text.push_str(chunk);
        }
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}
