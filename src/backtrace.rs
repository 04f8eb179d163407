use crate::error::{FoldscanError, Result};

/// One step of an alignment backtrace.
///
/// `Insertion` consumes a query residue, `Deletion` consumes a target
/// residue, `Match` consumes one of each and yields a residue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignOp {
    Match,
    Insertion,
    Deletion,
}

impl AlignOp {
    fn symbol(self) -> char {
        match self {
            AlignOp::Match => 'M',
            AlignOp::Insertion => 'I',
            AlignOp::Deletion => 'D',
        }
    }
}

/// Alignment backtrace over {Match, Insertion, Deletion}, convertible to
/// and from a run-length CIGAR-like string (e.g. `"12M2I3M"`).
///
/// Replaying the backtrace from (query_start, target_start) consumes
/// exactly the aligned spans of both sequences; residue index pairs are
/// produced only at `Match` steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    ops: Vec<AlignOp>,
}

impl Backtrace {
    pub fn new(ops: Vec<AlignOp>) -> Self {
        Backtrace { ops }
    }

    pub fn ops(&self) -> &[AlignOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of Match steps.
    pub fn match_count(&self) -> usize {
        self.ops.iter().filter(|op| **op == AlignOp::Match).count()
    }

    /// Query residues consumed by replaying the backtrace.
    pub fn query_span(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, AlignOp::Match | AlignOp::Insertion))
            .count()
    }

    /// Target residues consumed by replaying the backtrace.
    pub fn target_span(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, AlignOp::Match | AlignOp::Deletion))
            .count()
    }

    /// Replay from the given start positions, returning the (query, target)
    /// index pair of every Match step.
    pub fn matched_pairs(&self, query_start: usize, target_start: usize) -> Vec<(usize, usize)> {
        let mut pairs = Vec::with_capacity(self.match_count());
        let mut qi = query_start;
        let mut ti = target_start;
        for op in &self.ops {
            match op {
                AlignOp::Match => {
                    pairs.push((qi, ti));
                    qi += 1;
                    ti += 1;
                }
                AlignOp::Insertion => qi += 1,
                AlignOp::Deletion => ti += 1,
            }
        }
        pairs
    }

    /// Run-length encode to the string form, e.g. `"12M2I3M"`.
    pub fn to_cigar(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ops.iter().peekable();
        while let Some(op) = iter.next() {
            let mut run = 1usize;
            while iter.peek() == Some(&op) {
                iter.next();
                run += 1;
            }
            out.push_str(&run.to_string());
            out.push(op.symbol());
        }
        out
    }

    /// Parse the run-length string form produced by `to_cigar`.
    pub fn from_cigar(cigar: &str) -> Result<Self> {
        let mut ops = Vec::new();
        let mut num = String::new();
        for ch in cigar.chars() {
            if ch.is_ascii_digit() {
                num.push(ch);
                continue;
            }
            let run: usize = num
                .parse()
                .map_err(|_| FoldscanError::Format(format!("missing run length before '{ch}'")))?;
            num.clear();
            let op = match ch {
                'M' => AlignOp::Match,
                'I' => AlignOp::Insertion,
                'D' => AlignOp::Deletion,
                _ => {
                    return Err(FoldscanError::Format(format!(
                        "unknown alignment op '{ch}'"
                    )))
                }
            };
            ops.extend(std::iter::repeat(op).take(run));
        }
        if !num.is_empty() {
            return Err(FoldscanError::Format(
                "trailing run length without op".to_string(),
            ));
        }
        Ok(Backtrace { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cigar_roundtrip() {
        let bt = Backtrace::new(vec![
            AlignOp::Match,
            AlignOp::Match,
            AlignOp::Insertion,
            AlignOp::Match,
            AlignOp::Deletion,
            AlignOp::Deletion,
        ]);
        let cigar = bt.to_cigar();
        assert_eq!(cigar, "2M1I1M2D");
        assert_eq!(Backtrace::from_cigar(&cigar).unwrap(), bt);
    }

    #[test]
    fn replay_consumes_exact_spans() {
        let bt = Backtrace::from_cigar("3M2I1M1D").unwrap();
        assert_eq!(bt.query_span(), 6);
        assert_eq!(bt.target_span(), 5);
        assert_eq!(bt.match_count(), 4);
        let pairs = bt.matched_pairs(10, 20);
        assert_eq!(pairs, vec![(10, 20), (11, 21), (12, 22), (15, 23)]);
    }

    #[test]
    fn malformed_strings_rejected() {
        assert!(matches!(
            Backtrace::from_cigar("3M2X").unwrap_err(),
            FoldscanError::Format(_)
        ));
        assert!(matches!(
            Backtrace::from_cigar("M").unwrap_err(),
            FoldscanError::Format(_)
        ));
        assert!(matches!(
            Backtrace::from_cigar("12").unwrap_err(),
            FoldscanError::Format(_)
        ));
    }
}
