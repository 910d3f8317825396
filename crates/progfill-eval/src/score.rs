//! Best-effort selection over decoded beam candidates.

use tracing::trace;

use crate::executor::{CharTable, ProgramExecutor};

/// Result of scoring one batch element's beam candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredPrediction {
    /// Text of the best program found, empty if no candidate parsed.
    pub program_text: String,
    /// Number of provided examples the best program reproduced exactly.
    pub matches: usize,
    /// Whether every provided example was reproduced.
    pub solved: bool,
}

/// Score a batch element's beam candidates against its examples.
///
/// Candidates are visited best-first. The first candidate reproducing every
/// example short-circuits the rest; otherwise the highest-scoring parseable
/// candidate wins; if none parse, the element is unsolved with an empty
/// program string. A parse failure, or a runtime failure on any input,
/// discards that candidate and scoring proceeds — neither is a crash.
pub fn eval_predicted<X: ProgramExecutor>(
    executor: &X,
    beams: &[Vec<u32>],
    inputs: &[String],
    outputs: &[String],
) -> ScoredPrediction {
    let mut best_text = String::new();
    let mut best_score: i64 = -1;

    // Beams arrive ascending by score, so walk them in reverse.
    for beam in beams.iter().rev() {
        let program = match executor.decode(beam) {
            Ok(p) => p,
            Err(failure) => {
                trace!(%failure, "beam candidate failed to parse");
                continue;
            }
        };

        let mut score: i64 = 0;
        let mut aborted = false;
        for (input, expected) in inputs.iter().zip(outputs.iter()) {
            match executor.execute(&program, input) {
                Ok(out) if &out == expected => score += 1,
                Ok(_) => {}
                Err(failure) => {
                    trace!(%failure, "beam candidate failed to execute");
                    aborted = true;
                    break;
                }
            }
        }
        if aborted {
            continue;
        }

        if score > best_score {
            best_score = score;
            best_text = executor.program_text(&program);
        }
        if best_score >= inputs.len() as i64 {
            // Found a full solution, skip the remaining candidates.
            break;
        }
    }

    let matches = best_score.max(0) as usize;
    ScoredPrediction {
        program_text: best_text,
        matches,
        solved: best_score >= 0 && matches >= inputs.len(),
    }
}

/// Render one task's padded I/O token rows as plain strings plus the
/// `in < out > …` display form used in text reports.
pub fn decode_io(
    table: &CharTable,
    input_rows: &[Vec<u32>],
    output_rows: &[Vec<u32>],
) -> (Vec<String>, Vec<String>, String) {
    let mut inputs = Vec::with_capacity(input_rows.len());
    let mut outputs = Vec::with_capacity(output_rows.len());
    let mut display = String::new();
    for (inp, out) in input_rows.iter().zip(output_rows.iter()) {
        let i = table.decode_str(inp);
        let o = table.decode_str(out);
        display.push_str(&format!("{} < {} > ", i, o));
        inputs.push(i);
        outputs.push(o);
    }
    // Remove the trailing separator.
    let display = display.trim_end_matches(" > ").to_string();
    (inputs, outputs, display)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ConstStringDsl, ParseFailure, RuntimeFailure};

    fn dsl() -> ConstStringDsl {
        ConstStringDsl::new(CharTable::ascii_printable(), 1, 2)
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_perfect_match_short_circuits() {
        let dsl = dsl();
        let good = dsl.encode("hi").unwrap();
        let bad = vec![9999, dsl.eos()]; // would parse-fail if visited
        // Best candidate is last; it solves both examples so the earlier
        // (worse) beams are never consulted.
        let result = eval_predicted(
            &dsl,
            &[bad, good],
            &strings(&["a", "b"]),
            &strings(&["hi", "hi"]),
        );
        assert!(result.solved);
        assert_eq!(result.matches, 2);
        assert_eq!(result.program_text, "Const(\"hi\")");
    }

    #[test]
    fn test_parse_failures_fall_through_to_next_beam() {
        let dsl = dsl();
        let unparseable = vec![9999, dsl.eos()];
        let partial = dsl.encode("yes").unwrap();
        let result = eval_predicted(
            &dsl,
            &[partial, unparseable],
            &strings(&["x", "y"]),
            &strings(&["yes", "no"]),
        );
        assert!(!result.solved);
        assert_eq!(result.matches, 1);
        assert_eq!(result.program_text, "Const(\"yes\")");
    }

    #[test]
    fn test_no_parseable_candidate_is_unsolved_with_empty_text() {
        let dsl = dsl();
        let result = eval_predicted(
            &dsl,
            &[vec![9999, dsl.eos()], vec![8888, dsl.eos()]],
            &strings(&["x"]),
            &strings(&["y"]),
        );
        assert!(!result.solved);
        assert_eq!(result.matches, 0);
        assert_eq!(result.program_text, "");
    }

    /// Executor double whose programs parse but abort on a marked input.
    struct FaultyDsl;

    impl ProgramExecutor for FaultyDsl {
        type Program = u32;

        fn decode(&self, tokens: &[u32]) -> Result<u32, ParseFailure> {
            tokens.first().copied().ok_or(ParseFailure::Empty)
        }

        fn execute(&self, program: &u32, input: &str) -> Result<String, RuntimeFailure> {
            if input == "boom" {
                return Err(RuntimeFailure::Aborted("bad input".into()));
            }
            Ok(format!("p{}", program))
        }

        fn program_text(&self, program: &u32) -> String {
            format!("P{}", program)
        }
    }

    #[test]
    fn test_runtime_failure_discards_candidate() {
        // Best beam (id 7) aborts on the second input; the next beam (id 3)
        // matches the first example and is kept instead.
        let result = eval_predicted(
            &FaultyDsl,
            &[vec![3], vec![7]],
            &strings(&["ok", "boom"]),
            &strings(&["p3", "p7"]),
        );
        assert!(!result.solved);
        assert_eq!(result.matches, 1);
        assert_eq!(result.program_text, "P3");
    }

    #[test]
    fn test_decode_io_rendering() {
        let table = CharTable::ascii_printable();
        let a = |s: &str| s.chars().map(|c| table.id_for(c).unwrap()).collect::<Vec<_>>();
        let (inputs, outputs, display) = decode_io(
            &table,
            &[a("ab"), a("c")],
            &[a("AB"), a("C")],
        );
        assert_eq!(inputs, strings(&["ab", "c"]));
        assert_eq!(outputs, strings(&["AB", "C"]));
        assert_eq!(display, "ab < AB > c < C");
    }
}
