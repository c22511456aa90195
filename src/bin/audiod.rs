use anyhow::Result;

fn main() -> Result<()> {
    let code = audiod::cli::run()?;
    std::process::exit(code)
}
