// src/banner.rs

/// Prints the application startup banner to the console.
pub fn print_banner() {
    // Using a raw string literal for the multi-line banner
    let banner = r#"
                        _ _
  ___  __ _ _ __   __| | |__   _____  __
 / __|/ _` | '_ \ / _` | '_ \ / _ \ \/ /
 \__ \ (_| | | | | (_| | |_) | (_) >  <
 |___/\__,_|_| |_|\__,_|_.__/ \___/_/\_\

    Question Sandbox & Answer Generator
"#;
    println!("{}", banner);
}
