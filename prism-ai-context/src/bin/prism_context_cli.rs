use clap::Parser;
use prism_ai_context::{FileChunk, FileFilter, FilterConfig, FilterDecision, chunk_code_file, detect_language};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};

/// A CLI tool that shows how prism-ai-context would filter and chunk a file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Repository path of the file, used for type detection and chunk names.
    /// Defaults to the input path.
    #[arg(short, long)]
    path: Option<String>,

    /// Maximum size of each chunk in bytes.
    #[arg(short, long, default_value_t = 8000)]
    max_chunk_bytes: usize,

    /// Maximum accepted content size in bytes.
    #[arg(long, default_value_t = 100_000)]
    max_content_bytes: usize,
}

#[derive(Serialize)]
struct Report {
    path: String,
    language: &'static str,
    decision: FilterDecision,
    chunks: Vec<FileChunk>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let bytes = if let Some(input_path) = &args.input {
        fs::read(input_path)?
    } else {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        buffer
    };
    let content = String::from_utf8_lossy(&bytes);

    let path = args
        .path
        .or(args.input)
        .unwrap_or_else(|| "stdin".to_string());

    let filter = FileFilter::new(FilterConfig::default().with_max_content_bytes(args.max_content_bytes));
    let decision = filter.evaluate(&path, &content);
    let chunks = if decision.is_accepted() {
        chunk_code_file(&path, &content, args.max_chunk_bytes)
    } else {
        Vec::new()
    };

    let report = Report {
        language: detect_language(&path),
        path,
        decision,
        chunks,
    };

    let json_output = serde_json::to_string_pretty(&report)?;
    println!("{json_output}");

    Ok(())
}
