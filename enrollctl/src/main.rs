use clap::Parser;

fn main() {
    let cli = enrollctl::Cli::parse();
    if let Err(err) = enrollctl::run(cli) {
        eprintln!("erro: {err}");
        std::process::exit(1);
    }
}
