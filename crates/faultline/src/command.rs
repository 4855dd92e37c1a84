//! Expansion of command and directory templates.
//!
//! Templates are argv lists. Whole-argument placeholders:
//!
//! | Token | Expands to |
//! |-------|------------|
//! | `{addr}` | the node's virtual address |
//! | `{o_addrs}` | every other node's virtual address, one argument each |
//! | `{addrs}` | every node's virtual address, one argument each |

use std::net::Ipv4Addr;

pub const ADDR: &str = "{addr}";
pub const OTHER_ADDRS: &str = "{o_addrs}";
pub const ALL_ADDRS: &str = "{addrs}";

/// Argv for node `index`.
pub fn node_argv(template: &[String], index: usize, addrs: &[Ipv4Addr]) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + addrs.len());
    for arg in template {
        match arg.as_str() {
            ADDR => argv.push(addrs[index].to_string()),
            OTHER_ADDRS => argv.extend(
                addrs
                    .iter()
                    .enumerate()
                    .filter(|&(other, _)| other != index)
                    .map(|(_, addr)| addr.to_string()),
            ),
            ALL_ADDRS => argv.extend(addrs.iter().map(ToString::to_string)),
            _ => argv.push(arg.clone()),
        }
    }
    argv
}

/// Argv for clients and the validator, which know every node.
pub fn cluster_argv(template: &[String], addrs: &[Ipv4Addr]) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len() + addrs.len());
    for arg in template {
        if arg == ALL_ADDRS {
            argv.extend(addrs.iter().map(ToString::to_string));
        } else {
            argv.push(arg.clone());
        }
    }
    argv
}

/// Replaces every `{addr}` inside `template`.
pub fn node_dir(template: &str, addr: Ipv4Addr) -> String {
    template.replace(ADDR, &addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn addrs() -> Vec<Ipv4Addr> {
        vec![
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::new(127, 0, 0, 3),
            Ipv4Addr::new(127, 0, 0, 4),
        ]
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn node_template() {
        let template = argv(&["/bin/kv", "--me", "{addr}", "--peers", "{o_addrs}"]);
        assert_eq!(
            node_argv(&template, 1, &addrs()),
            argv(&["/bin/kv", "--me", "127.0.0.3", "--peers", "127.0.0.2", "127.0.0.4"])
        );
    }

    #[test]
    fn placeholders_only_match_whole_arguments() {
        let template = argv(&["--addr={addr}"]);
        assert_eq!(node_argv(&template, 0, &addrs()), template);
    }

    #[test]
    fn cluster_template() {
        let template = argv(&["/bin/check", "{addrs}"]);
        assert_eq!(
            cluster_argv(&template, &addrs()),
            argv(&["/bin/check", "127.0.0.2", "127.0.0.3", "127.0.0.4"])
        );
    }

    #[test_case("/var/kv/{addr}/data", "/var/kv/10.0.0.1/data" ; "nested")]
    #[test_case("/tmp/{addr}-{addr}", "/tmp/10.0.0.1-10.0.0.1" ; "repeated")]
    #[test_case("/srv/shared", "/srv/shared" ; "no placeholder")]
    fn directory_template(template: &str, expected: &str) {
        assert_eq!(node_dir(template, Ipv4Addr::new(10, 0, 0, 1)), expected);
    }
}
