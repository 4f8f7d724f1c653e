use clap::Parser;

mod cli;

fn main() {
    // Usage errors exit with code 2 from clap
    let parsed = cli::Cli::parse();
    let operation = parsed.operation();

    match parsed.dispatch() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(operation.fail_exit_code());
        }
    }
}
