use std::io::Write;
use std::path::Path;

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner.
pub fn print_banner(listen_addr: &str, receive_dir: &Path) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                 🔗  nearchat  CLI  🔗               ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Listen  : {listen_addr:<41} ║");
    println!("║  Save to : {:<41} ║", receive_dir.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    listen [addr]        Wait for a peer to connect");
    println!("    connect <addr>       Connect to a listening peer");
    println!("    say <message>        Send a chat message");
    println!("    send <file_path>     Send a file");
    println!("    accept / reject      Answer the verification code");
    println!("    stop                 Tear the session down");
    println!("    clear                Clear the last error");
    println!("    help                 Show this help");
    println!("    quit                 Shut down and exit");
    println!();
    println!("  After the handshake, both screens show a 5-digit code.");
    println!("  Compare them out loud before accepting.");
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
