use crate::parse::parse_sql;
use crate::sql::SqlExec;
use std::io::{self, BufRead, Write};
use tracing::{debug, warn};

pub const PROMPT: &str = "SQL> ";
const QUIT: &str = "quit";
const TEST: &str = "test";

/// Reads statements line by line until `quit` or end of input.
pub fn run_shell<R: BufRead, W: Write>(
    exec: &mut SqlExec,
    input: R,
    mut output: W,
) -> io::Result<()> {
    let mut lines = input.lines();
    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        let Some(line) = lines.next().transpose()? else {
            writeln!(output)?;
            break;
        };
        let sql = line.trim();
        if sql == QUIT {
            break;
        }
        if sql.is_empty() {
            continue;
        }
        handle_line(exec, sql, &mut output)?;
    }
    output.flush()
}

fn handle_line<W: Write>(exec: &mut SqlExec, sql: &str, output: &mut W) -> io::Result<()> {
    if sql == TEST {
        let passed = exec.store().self_test().unwrap_or_else(|e| {
            warn!(error = %e, "storage self-test errored");
            false
        });
        let verdict = if passed { "Passed" } else { "Failed" };
        return writeln!(output, "test_heap_storage: {verdict}");
    }

    let statements = match parse_sql(sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "rejected input");
            return writeln!(output, "INVALID SQL: {sql}\n{e}");
        }
    };
    for statement in &statements {
        writeln!(output, "{statement}")?;
        match exec.execute(statement) {
            Ok(result) => writeln!(output, "{result}")?,
            Err(e) => writeln!(output, "Error: {e}")?,
        }
    }
    Ok(())
}
