use petrel::error::{EngineError, Result};
use petrel::exec::{execute_query, ExecutionParams, QueryOutput};
use petrel::query::parse_select;
use petrel::table::{Table, TableRegistry};
use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

struct ShellState {
    tables: TableRegistry,
    params: ExecutionParams,
    timing: bool,
    repeats: u32,
    done: bool,
}

impl ShellState {
    fn new() -> Self {
        Self {
            tables: TableRegistry::new(),
            params: ExecutionParams::default(),
            timing: true,
            repeats: 1,
            done: false,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut state = ShellState::new();
    let stdin = io::stdin();
    let mut command = String::new();

    prompt(&command);
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if !command.is_empty() {
            command.push('\n');
        }
        command.push_str(&line);

        if command_terminated(&command) {
            if let Err(err) = process_command(&mut state, &command) {
                println!("ERROR: {err}");
            }
            command.clear();
        }
        if state.done {
            return;
        }
        prompt(&command);
    }
}

fn prompt(pending: &str) {
    let text = if pending.is_empty() { ">> " } else { "== " };
    print!("{text}");
    let _ = io::stdout().flush();
}

fn command_terminated(text: &str) -> bool {
    text.trim_end().ends_with(';')
}

fn process_command(state: &mut ShellState, text: &str) -> Result<()> {
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|token| !token.is_empty())
        .collect();
    let Some(&command) = tokens.first() else {
        return Ok(());
    };
    let args = &tokens[1..];

    match command.to_lowercase().as_str() {
        "help" => {
            println!("Available commands:");
            for name in ["help", "quit", "set", "load", "save", "forget", "repeat", "select", "schema"] {
                println!("  - {name}");
            }
            Ok(())
        }
        "quit" => {
            state.done = true;
            Ok(())
        }
        "set" => process_set(state, args),
        "load" => process_load(state, args),
        "save" => process_save(state, args),
        "forget" => {
            require_args(args, 1, 1, "forget")?;
            let name = args[0].to_lowercase();
            if state.tables.remove(&name).is_none() {
                return Err(EngineError::invalid(format!("table not found: {name}")));
            }
            Ok(())
        }
        "repeat" => {
            require_args(args, 1, 1, "repeat")?;
            let repeats: u32 = args[0]
                .parse()
                .map_err(|_| EngineError::invalid(format!("invalid repeat count: {}", args[0])))?;
            state.repeats = repeats.max(1);
            Ok(())
        }
        "schema" => process_schema(state, args),
        "select" => process_select(state, text),
        other => Err(EngineError::invalid(format!("unknown command: {other}"))),
    }
}

fn require_args(args: &[&str], min: usize, max: usize, command: &str) -> Result<()> {
    if args.len() < min || args.len() > max {
        if min == max {
            return Err(EngineError::invalid(format!(
                "{command} requires {min} args"
            )));
        }
        return Err(EngineError::invalid(format!(
            "{command} requires {min}..{max} args"
        )));
    }
    Ok(())
}

fn process_set(state: &mut ShellState, args: &[&str]) -> Result<()> {
    require_args(args, 1, 2, "set")?;
    let name = args[0].to_lowercase();
    let value = match args.get(1) {
        Some(&text) => Some(parse_bool(text)?),
        None => None,
    };

    let flag = match name.as_str() {
        "timing" => &mut state.timing,
        "simd" => &mut state.params.use_simd,
        "parallel" => &mut state.params.parallel,
        other => return Err(EngineError::invalid(format!("unknown variable: {other}"))),
    };
    if let Some(value) = value {
        *flag = value;
    }
    println!("{name} is {}.", if *flag { "on" } else { "off" });
    Ok(())
}

fn parse_bool(text: &str) -> Result<bool> {
    match text.to_lowercase().as_str() {
        "true" | "on" => Ok(true),
        "false" | "off" => Ok(false),
        other => Err(EngineError::invalid(format!("invalid boolean: {other}"))),
    }
}

fn process_load(state: &mut ShellState, args: &[&str]) -> Result<()> {
    require_args(args, 2, 3, "load")?;
    let name = args[0].to_lowercase();
    let path = args[1];
    let fields: Option<Vec<String>> = args
        .get(2)
        .map(|list| list.split(',').map(|field| field.to_string()).collect());

    let started = Instant::now();
    let table = Table::load(&name, path, fields.as_deref())?;
    if state.timing {
        println!("Duration: {}ms", started.elapsed().as_millis());
    }
    state.tables.insert(name, table);
    Ok(())
}

fn process_save(state: &mut ShellState, args: &[&str]) -> Result<()> {
    require_args(args, 2, 2, "save")?;
    let name = args[0].to_lowercase();
    let path = args[1];
    let table = state
        .tables
        .get(&name)
        .ok_or_else(|| EngineError::invalid(format!("table not found: {name}")))?;

    let started = Instant::now();
    table.save(path)?;
    if state.timing {
        println!("Duration: {}ms", started.elapsed().as_millis());
    }
    Ok(())
}

fn process_schema(state: &ShellState, args: &[&str]) -> Result<()> {
    require_args(args, 1, 1, "schema")?;
    let name = args[0].to_lowercase();
    let table = state
        .tables
        .get(&name)
        .ok_or_else(|| EngineError::invalid(format!("table not found: {name}")))?;

    println!(
        "{:<20}{:<20}{:<20}{:<20}",
        "Name", "Type", "Group#", "Layout"
    );
    println!(
        "{:<20}{:<20}{:<20}{:<20}",
        "====", "====", "======", "======"
    );
    for desc in table.schema() {
        let layout = match desc.layout {
            petrel::column_data::ColumnLayout::Dict => "DICT",
            petrel::column_data::ColumnLayout::Raw => "RAW",
        };
        println!(
            "{:<20}{:<20}{:<20}{:<20}",
            desc.name,
            desc.ty.to_display_string(),
            table.row_group_count(),
            layout
        );
    }
    Ok(())
}

fn process_select(state: &ShellState, text: &str) -> Result<()> {
    let query = parse_select(text, &state.tables)?;

    if state.repeats != 1 {
        println!("repeating {} times.", state.repeats);
    }

    let started = Instant::now();
    let mut output: Option<QueryOutput> = None;
    for _ in 0..state.repeats {
        output = Some(execute_query(&query, &state.params)?);
    }
    let elapsed = started.elapsed();

    if let Some(output) = output {
        print_output(&output);
    }
    if state.timing {
        println!("Duration: {}ms", elapsed.as_millis());
    }
    Ok(())
}

fn print_output(output: &QueryOutput) {
    let mut widths: Vec<usize> = output.field_names.iter().map(String::len).collect();
    for row in &output.values {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(value.len());
        }
    }

    let print_row = |row: &[String]| {
        for (i, value) in row.iter().enumerate() {
            print!("{value:<width$}", width = widths[i] + 3);
        }
        println!();
    };

    print_row(&output.field_names);
    let separators: Vec<String> = widths.iter().map(|&w| "=".repeat(w)).collect();
    print_row(&separators);
    for row in &output.values {
        print_row(row);
    }
}
