//! labgate server binary

fn main() {
    if let Err(e) = labgate::cli::run() {
        eprintln!("{}", e);
        std::process::exit(e.code().exit_code());
    }
}
