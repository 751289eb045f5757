//! Port selection for locally-spawned HTTP/SSE servers.
//!
//! Grounded on `examples/original_source/tools/connector.py`'s
//! `find_available_port` (bind-test a range starting at a preferred port)
//! and its `--port`/`--port=N` argv rewriting on conflict.

use std::net::TcpListener;

const DEFAULT_PORT_SEARCH_ATTEMPTS: u32 = 100;

/// Find a free TCP port, preferring `preferred` if given and free.
/// Tries `preferred, preferred+1, .. preferred+attempts` (or a random
/// base in the ephemeral range if no preference was given).
pub fn find_available_port(preferred: Option<u16>, attempts: u32) -> Option<u16> {
    let attempts = if attempts == 0 {
        DEFAULT_PORT_SEARCH_ATTEMPTS
    } else {
        attempts
    };
    let start = preferred.unwrap_or(49152);
    for offset in 0..attempts {
        let candidate = start.checked_add(offset as u16)?;
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Rewrite any `--port <old>`, `--port=<old>`, or a bare `--port` followed
/// by `<old>` token in `args` to use `new` instead. Mutates in place.
pub fn rewrite_port_arg(args: &mut [String], old: u16, new: u16) {
    let old_eq = format!("--port={old}");
    let new_eq = format!("--port={new}");
    let mut i = 0;
    while i < args.len() {
        if args[i] == old_eq {
            args[i] = new_eq.clone();
        } else if args[i] == "--port" {
            if let Some(next) = args.get_mut(i + 1) {
                if next == &old.to_string() {
                    *next = new.to_string();
                }
            }
        } else if args[i].contains(&old.to_string()) && args[i].starts_with("--port") {
            args[i] = args[i].replace(&old.to_string(), &new.to_string());
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_free_port_near_preference() {
        let port = find_available_port(Some(51234), 50).expect("a port should be free");
        assert!(port >= 51234);
    }

    #[test]
    fn rewrites_space_separated_port_flag() {
        let mut args = vec!["--port".to_string(), "3001".to_string()];
        rewrite_port_arg(&mut args, 3001, 3050);
        assert_eq!(args, vec!["--port".to_string(), "3050".to_string()]);
    }

    #[test]
    fn rewrites_equals_separated_port_flag() {
        let mut args = vec!["--port=3001".to_string()];
        rewrite_port_arg(&mut args, 3001, 3050);
        assert_eq!(args, vec!["--port=3050".to_string()]);
    }

    #[test]
    fn leaves_unrelated_args_untouched() {
        let mut args = vec!["--verbose".to_string(), "--other=3001".to_string()];
        rewrite_port_arg(&mut args, 3001, 3050);
        assert_eq!(args, vec!["--verbose".to_string(), "--other=3001".to_string()]);
    }
}
