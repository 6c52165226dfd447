use ancile::cli::Cli;
use clap::Parser;

fn main() {
    let code = ancile::cli::run(Cli::parse());
    std::process::exit(code);
}
