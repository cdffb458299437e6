//! Convolution kernel files.
//!
//! A kernel is a text matrix, one row per line, coefficients separated by
//! whitespace:
//!
//! ```text
//! 0 -1  0
//! -1 5 -1
//! 0 -1  0
//! ```
//!
//! Blank lines are ignored. Every row must have the same width.

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("kernel file is not valid UTF-8")]
    NotUtf8,
    #[error("kernel file has no coefficients")]
    Empty,
    #[error("line {line}: '{token}' is not a number")]
    InvalidNumber { line: usize, token: String },
    #[error("line {line}: expected {expected} coefficients, found {found}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
}

impl Kernel {
    pub fn parse(bytes: &[u8]) -> Result<Self, KernelError> {
        let text = std::str::from_utf8(bytes).map_err(|_| KernelError::NotUtf8)?;

        let mut rows = 0;
        let mut cols = 0;
        let mut values = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let start = values.len();

            for token in line.split_whitespace() {
                let value = token.parse::<f32>().map_err(|_| KernelError::InvalidNumber {
                    line: line_no,
                    token: token.to_string(),
                })?;
                values.push(value);
            }

            let found = values.len() - start;
            if found == 0 {
                continue;
            }
            if rows == 0 {
                cols = found;
            } else if found != cols {
                return Err(KernelError::RaggedRow {
                    line: line_no,
                    expected: cols,
                    found,
                });
            }
            rows += 1;
        }

        if rows == 0 {
            return Err(KernelError::Empty);
        }

        Ok(Self { rows, cols, values })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[cfg(test)]
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows && col < self.cols {
            Some(self.values[row * self.cols + col])
        } else {
            None
        }
    }

    /// Sum of all coefficients.
    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }
}
