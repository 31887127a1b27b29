use std::fmt::Display;

/// An error produced by a [Scanner], pointing at the offending position.
#[derive(Copy, Clone, Debug)]
pub struct ScanError {
    /// 1-based character position in the scanned string.
    pub position: usize,
    pub message: &'static str,
}

impl Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (at character {})", self.message, self.position)
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

/// A mutable cursor over a string, for hand-rolled recursive-descent
/// parsers. Consuming methods advance the cursor; nothing is ever put back.
pub struct Scanner<'a> {
    rest: &'a str,
    original_len: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            rest: input,
            original_len: input.len(),
        }
    }

    pub fn done(&self) -> bool {
        self.rest.is_empty()
    }

    /// 1-based character position of the cursor. Assumes the consumed
    /// prefix falls on a character boundary, which consuming methods
    /// guarantee.
    pub fn position(&self) -> usize {
        let consumed = self.original_len - self.rest.len();
        consumed + 1
    }

    pub fn error(&self, message: &'static str) -> ScanError {
        ScanError {
            position: self.position(),
            message,
        }
    }

    /// Consumes `literal` if the input starts with it.
    pub fn eat(&mut self, literal: &str) -> bool {
        match self.rest.strip_prefix(literal) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    /// Like [Scanner::eat], but failing to match is an error.
    pub fn expect(&mut self, literal: &str, message: &'static str) -> ScanResult<()> {
        if self.eat(literal) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    pub fn skip_spaces(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Consumes the longest prefix whose characters satisfy `pred`
    /// and returns it; possibly empty.
    pub fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|(_idx, c)| !pred(*c))
            .map(|(idx, _c)| idx)
            .unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    /// Consumes a run of decimal digits and parses it.
    pub fn number<T: std::str::FromStr>(&mut self, message: &'static str) -> ScanResult<T> {
        let start = *self;
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits.parse().map_err(|_| start.error(message))
    }
}

// The scanner is a plain (&str, usize) pair, cheap to snapshot for
// backtracking or error positions.
impl Clone for Scanner<'_> {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for Scanner<'_> {}

#[cfg(test)]
mod tests {
    use super::Scanner;

    #[test]
    fn eat_and_expect() {
        let mut scanner = Scanner::new("foo(bar)");
        assert!(scanner.eat("foo"));
        assert!(!scanner.eat("foo"));
        scanner.expect("(", "expected '('").unwrap();
        assert_eq!(scanner.take_while(|c| c.is_alphanumeric()), "bar");
        assert!(scanner.expect("]", "expected ']'").is_err());
        scanner.expect(")", "expected ')'").unwrap();
        assert!(scanner.done());
    }

    #[test]
    fn numbers_and_positions() {
        let mut scanner = Scanner::new("abc 123x");
        scanner.take_while(|c| c.is_alphabetic());
        scanner.skip_spaces();
        let n: u16 = scanner.number("expected a number").unwrap();
        assert_eq!(n, 123);

        let err = scanner.number::<u16>("expected a number").unwrap_err();
        assert_eq!(err.position, 8);
    }
}
