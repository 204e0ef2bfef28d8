// Veld CLI - Command Line Interface
// Usage: veld [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::PathBuf;

use veld_core::lexer::{Scanner, TokenKind};
use veld_core::vm::Vm;

/// Veld - A fast, class-based interpreted language
#[derive(Parser)]
#[command(name = "veld")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A fast, class-based interpreted language", long_about = None)]
struct Cli {
    /// Source file to run (.veld)
    file: Option<PathBuf>,

    /// Debug options: tokens, asm, gc (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let debug = DebugFlags::from_options(&cli.debug);

    let code = if let Some(code) = cli.exec {
        run_source(&code, "<exec>", &debug)
    } else if let Some(path) = cli.file {
        run_file(&path, &debug)
    } else {
        repl(&debug)
    };
    std::process::exit(code);
}

#[derive(Default, Clone)]
struct DebugFlags {
    tokens: bool,
    asm: bool,
    gc: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "tokens" => flags.tokens = true,
                    "asm" => flags.asm = true,
                    "gc" => flags.gc = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn run_file(path: &PathBuf, debug: &DebugFlags) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", path.display(), err);
            return 74;
        }
    };
    let name = path.to_string_lossy().to_string();
    run_source(&source, &name, debug)
}

fn run_source(source: &str, name: &str, debug: &DebugFlags) -> i32 {
    if debug.tokens {
        dump_tokens(source);
    }
    let mut vm = Vm::new();
    vm.dump_asm = debug.asm;
    vm.log_gc = debug.gc;
    match vm.interpret(source, name, false) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            err.exit_code()
        }
    }
}

fn dump_tokens(source: &str) {
    let mut scanner = Scanner::new(source);
    loop {
        let token = scanner.scan_token();
        println!("{:4} {:?} '{}'", token.line, token.kind, token.lexeme);
        if matches!(token.kind, TokenKind::Eof) {
            break;
        }
    }
}

/// Is this input obviously unfinished (unbalanced delimiters or an open
/// string)? The REPL keeps reading continuation lines until it balances.
fn is_incomplete(code: &str) -> bool {
    let mut braces = 0i32;
    let mut parens = 0i32;
    let mut brackets = 0i32;
    let mut in_string = false;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => {
                    chars.next();
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                // Line comment: skip to end of line.
                for rest in chars.by_ref() {
                    if rest == '\n' {
                        break;
                    }
                }
            }
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
    }
    braces > 0 || parens > 0 || brackets > 0 || in_string
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn print_repl_help() {
    println!("  .help    show this help");
    println!("  .reset   discard all session state");
    println!("  .clear   clear the screen");
    println!("  .exit    leave the REPL");
    println!();
    println!("  An empty line runs pending multi-line input.");
}

fn repl(debug: &DebugFlags) -> i32 {
    use reedline::{
        FileBackedHistory, Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline,
        Signal,
    };
    use std::borrow::Cow;

    struct MainPrompt;
    struct ContinuePrompt;

    impl Prompt for MainPrompt {
        fn render_prompt_left(&self) -> Cow<'_, str> {
            Cow::Borrowed(">>> ")
        }
        fn render_prompt_right(&self) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_indicator(&self, _: reedline::PromptEditMode) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
            Cow::Borrowed("... ")
        }
        fn render_prompt_history_search_indicator(
            &self,
            history_search: PromptHistorySearch,
        ) -> Cow<'_, str> {
            let prefix = match history_search.status {
                PromptHistorySearchStatus::Passing => "",
                PromptHistorySearchStatus::Failing => "failing ",
            };
            Cow::Owned(format!(
                "({}reverse-search: {}) ",
                prefix, history_search.term
            ))
        }
    }

    impl Prompt for ContinuePrompt {
        fn render_prompt_left(&self) -> Cow<'_, str> {
            Cow::Borrowed("... ")
        }
        fn render_prompt_right(&self) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_indicator(&self, _: reedline::PromptEditMode) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
            Cow::Borrowed("... ")
        }
        fn render_prompt_history_search_indicator(
            &self,
            history_search: PromptHistorySearch,
        ) -> Cow<'_, str> {
            let prefix = match history_search.status {
                PromptHistorySearchStatus::Passing => "",
                PromptHistorySearchStatus::Failing => "failing ",
            };
            Cow::Owned(format!(
                "({}reverse-search: {}) ",
                prefix, history_search.term
            ))
        }
    }

    println!();
    println!(
        "  {}  {}",
        "Veld".cyan().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!("  {}", "Type .help for commands, .exit to quit".bright_black());
    println!();

    let history_path = dirs_home().join(".veld_history");
    let mut line_editor = match FileBackedHistory::with_file(1000, history_path) {
        Ok(history) => Reedline::create().with_history(Box::new(history)),
        Err(_) => Reedline::create(),
    };
    let main_prompt = MainPrompt;
    let continue_prompt = ContinuePrompt;

    // One VM for the whole session; module globals persist across lines.
    let mut vm = Vm::new();
    vm.dump_asm = debug.asm;
    vm.log_gc = debug.gc;
    let mut accumulated = String::new();

    loop {
        let prompt: &dyn Prompt = if accumulated.is_empty() {
            &main_prompt
        } else {
            &continue_prompt
        };
        match line_editor.read_line(prompt) {
            Ok(Signal::Success(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() && !accumulated.is_empty() {
                    // Empty line flushes pending multi-line input.
                    let input = std::mem::take(&mut accumulated);
                    run_repl_line(&mut vm, &input, debug);
                    continue;
                }
                if trimmed.is_empty() {
                    continue;
                }
                if accumulated.is_empty() {
                    match trimmed {
                        ".exit" => return 0,
                        ".help" => {
                            print_repl_help();
                            continue;
                        }
                        ".reset" => {
                            vm = Vm::new();
                            vm.dump_asm = debug.asm;
                            vm.log_gc = debug.gc;
                            println!("session reset");
                            continue;
                        }
                        ".clear" => {
                            print!("\x1B[2J\x1B[H");
                            continue;
                        }
                        _ => {}
                    }
                }

                accumulated.push_str(&line);
                accumulated.push('\n');
                if is_incomplete(&accumulated) {
                    continue;
                }
                let input = std::mem::take(&mut accumulated);
                run_repl_line(&mut vm, &input, debug);
            }
            Ok(Signal::CtrlC) => {
                accumulated.clear();
                println!("^C");
            }
            Ok(Signal::CtrlD) => return 0,
            Err(err) => {
                eprintln!("REPL error: {}", err);
                return 1;
            }
        }
    }
}

fn run_repl_line(vm: &mut Vm, input: &str, debug: &DebugFlags) {
    if debug.tokens {
        dump_tokens(input);
    }
    if let Err(err) = vm.interpret(input, "repl", true) {
        eprintln!("{}", err);
    }
}
