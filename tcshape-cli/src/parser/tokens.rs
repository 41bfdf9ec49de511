//! Whitespace token cursor over one line of `tc ... show` output.

/// Cursor over the whitespace-separated tokens of a line.
///
/// Keyword lookups (`value_after`) scan the whole line, so the position of a
/// field in tc's output does not matter and unknown fields are skipped.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    pub fn new(line: &'a str) -> Self {
        Self {
            tokens: line.split_whitespace().collect(),
            pos: 0,
        }
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&'a str> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    /// Advance past the next token equal to `keyword`.
    pub fn seek(&mut self, keyword: &str) -> bool {
        match self.tokens[self.pos..].iter().position(|t| *t == keyword) {
            Some(offset) => {
                self.pos += offset + 1;
                true
            }
            None => {
                self.pos = self.tokens.len();
                false
            }
        }
    }

    /// Move the cursor to just after the first occurrence of `keyword`.
    pub fn rewind_to(&mut self, keyword: &str) -> bool {
        self.pos = 0;
        self.seek(keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.tokens.contains(&keyword)
    }

    /// The token following the first occurrence of `keyword`.
    pub fn value_after(&self, keyword: &str) -> Option<&'a str> {
        self.values_after(keyword, 1).into_iter().next()
    }

    /// Up to `n` tokens following the first occurrence of `keyword`.
    pub fn values_after(&self, keyword: &str, n: usize) -> Vec<&'a str> {
        self.tokens
            .iter()
            .position(|t| *t == keyword)
            .map(|i| self.tokens[i + 1..].iter().take(n).copied().collect())
            .unwrap_or_default()
    }

    /// Token at a fixed position from the start of the line.
    pub fn nth(&self, index: usize) -> Option<&'a str> {
        self.tokens.get(index).copied()
    }
}
