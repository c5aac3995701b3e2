use std::io::Write;

use litecore::{Connection, DatabaseConfig, Row};
use rustyline::{DefaultEditor, Result, error::ReadlineError};

const HISTORY_FILE: &str = ".litecore_history";

fn read_multiline_command(rl: &mut DefaultEditor) -> Result<String> {
    let mut input = String::new();
    let mut prompt = "litecore> ".to_string();

    loop {
        let line = rl.readline(&prompt)?;
        let trimmed_line = line.trim_end();

        // Trailing backslash continues the command on the next line
        if let Some(head) = trimmed_line.strip_suffix('\\') {
            input.push_str(head);
            input.push(' ');
            prompt = "      -> ".to_string();
        } else {
            input.push_str(trimmed_line);
            break;
        }
    }

    Ok(input)
}

fn print_rows(columns: &[String], rows: &[Row]) {
    if !columns.is_empty() {
        println!("{}", columns.join("|"));
    }
    for row in rows {
        let line: Vec<String> = row.values.iter().map(ToString::to_string).collect();
        println!("{}", line.join("|"));
    }
}

fn run_sql(conn: &mut Connection, sql: &str) -> litecore::Result<()> {
    let mut statement = conn.prepare(sql)?;
    let columns = statement.column_names().to_vec();
    let rows = statement.rows().collect::<litecore::Result<Vec<_>>>()?;
    statement.finalize()?;
    print_rows(&columns, &rows);
    Ok(())
}

fn run_query(conn: &mut Connection, sql: &str) {
    match conn.query(sql, &[]) {
        Ok(rows) => print_rows(&[], &rows),
        Err(e) => eprintln!("Error: {e}"),
    }
}

/// Returns false when the REPL should stop.
fn process_command(conn: &mut Connection, command: &str) -> bool {
    let cmd = command.trim();

    match cmd.to_lowercase().as_str() {
        ".quit" | ".exit" | "exit" | "quit" => {
            println!("Goodbye!");
            return false;
        }
        ".help" | "help" => {
            println!(
                r#"
Available commands:
  .help            - Show this help message
  .tables          - List tables
  .schema          - Show CREATE statements
  .clear           - Clear the screen
  .quit, .exit     - Exit

Anything else is run as SQL; separate statements with ';'.
Use '\' at the end of a line for multiline input.
Use Up/Down arrows to navigate command history.
"#
            );
        }
        ".tables" => run_query(
            conn,
            "SELECT name FROM sqlite_schema WHERE type = 'table' ORDER BY name",
        ),
        ".schema" => run_query(
            conn,
            "SELECT sql FROM sqlite_schema WHERE sql IS NOT NULL ORDER BY tbl_name, type DESC",
        ),
        ".clear" => {
            print!("\x1B[2J\x1B[1;1H");
            let _ = std::io::stdout().flush();
        }
        "" => {}
        _ => {
            let statements = match litecore::planner::parser::split_statements(cmd) {
                Ok(statements) => statements,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return true;
                }
            };
            for sql in statements {
                if let Err(e) = run_sql(conn, &sql) {
                    eprintln!("Error: {e}");
                    break;
                }
            }
        }
    }

    true
}

fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "litecore.db".to_string());
    let mut conn = match Connection::open(&path, DatabaseConfig::default()) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Error: cannot open {path}: {e}");
            std::process::exit(1);
        }
    };
    println!("litecore {} - connected to {path}", env!("CARGO_PKG_VERSION"));
    println!("Enter \".help\" for usage hints.");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(HISTORY_FILE);

    loop {
        match read_multiline_command(&mut rl) {
            Ok(input) => {
                let command = input.trim().to_string();
                if !command.is_empty() {
                    rl.add_history_entry(&command)?;
                    if !process_command(&mut conn, &command) {
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("Interrupted");
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err:?}");
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(HISTORY_FILE) {
        eprintln!("Could not save history: {e}");
    }
    if let Err(e) = conn.close() {
        eprintln!("Error: {e}");
    }
    Ok(())
}
