//! Tunnel command line composition

use super::management::MANAGEMENT_ADDR;
use crate::config::{BufferSize, Settings};
use crate::platform::TargetOs;
use crate::server::{Cipher, Protocol};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Resolver hook shipped by most distributions
pub const SYSTEM_UPDOWN_SCRIPT: &str = "/etc/openvpn/update-resolv-conf";
const BUNDLED_UPDOWN_SCRIPT: &str = "update-resolv-conf";
const MAC_UP_SCRIPT: &str = "client.up.osx.sh -m -w -d -f -ptADGNWradsgnw";
const MAC_DOWN_SCRIPT: &str = "client.down.osx.sh -m -w -d -f -ptADGNWradsgnw";
const BLOCK_UDP_PLUGIN: &str = "block-incoming-udp.dll";

/// Everything one tunnel launch depends on
pub struct TunnelArgs<'a> {
    pub os: TargetOs,
    pub config: &'a Path,
    pub log: &'a Path,
    pub address: Ipv4Addr,
    pub port: u16,
    /// Transport on the wire; obfuscated servers are reached over TCP
    pub protocol: Protocol,
    pub cipher: Cipher,
    pub cert: &'a Path,
    pub key: &'a Path,
    /// (major, minor) of the tunnel binary
    pub version: (u32, u32),
    pub settings: &'a Settings,
    /// Local SOCKS port of the obfuscation proxy, when in use
    pub socks_port: Option<u16>,
    pub install_dir: &'a Path,
    /// Linux resolver hook, see [`updown_script`]
    pub updown_script: Option<PathBuf>,
}

/// Major and minor version from `openvpn --version` output
pub fn parse_version(stdout: &str) -> Option<(u32, u32)> {
    let version = stdout.split(' ').nth(1)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// The system resolver hook if present, otherwise the bundled copy
pub fn updown_script(system: &Path, install_dir: &Path) -> PathBuf {
    if system.exists() {
        system.to_path_buf()
    } else {
        install_dir.join(BUNDLED_UPDOWN_SCRIPT)
    }
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Full argument list, program name excluded
pub fn compose(input: &TunnelArgs<'_>) -> Vec<String> {
    let settings = input.settings;
    let mut args = Vec::new();

    push(&mut args, &["--config", &path_str(input.config)]);
    push(&mut args, &["--log", &path_str(input.log)]);
    push(&mut args, &["--remote", &input.address.to_string(), &input.port.to_string()]);
    push(&mut args, &["--cert", &path_str(input.cert)]);
    push(&mut args, &["--key", &path_str(input.key)]);
    push(
        &mut args,
        &[
            "--management",
            &MANAGEMENT_ADDR.ip().to_string(),
            &MANAGEMENT_ADDR.port().to_string(),
        ],
    );
    push(&mut args, &["--cipher", input.cipher.tunnel_name()]);

    let transport = match input.protocol {
        Protocol::Udp => "udp",
        Protocol::Tcp | Protocol::Obfs2 => "tcp",
    };
    let mut proto = transport.to_string();
    if settings.tunnel_ipv6 {
        push(&mut args, &["--tun-ipv6"]);
    } else if input.version.0 == 2 && input.version.1 >= 4 {
        proto.push('4');
        push(&mut args, &["--pull-filter", "ignore", "ifconfig-ipv6 "]);
        push(&mut args, &["--pull-filter", "ignore", "route-ipv6 "]);
    }
    push(&mut args, &["--proto", &proto]);

    if let BufferSize::Bytes(n) = settings.send_recv_buffers {
        let n = n.to_string();
        push(&mut args, &["--sndbuf", &n]);
        push(&mut args, &["--rcvbuf", &n]);
    }

    if let Some(port) = input.socks_port {
        push(&mut args, &["--socks-proxy", "127.0.0.1", &port.to_string()]);
    }

    args.extend(settings.custom_args());

    match input.os {
        TargetOs::Mac if !settings.stop_dns_leaks => {
            push(&mut args, &["--up", MAC_UP_SCRIPT]);
            push(&mut args, &["--down", MAC_DOWN_SCRIPT]);
        }
        TargetOs::Mac => {}
        TargetOs::Windows => {
            if settings.windows_block_outside_dns {
                push(&mut args, &["--block-outside-dns"]);
            }
            if settings.block_incoming_udp {
                let plugin = path_str(&input.install_dir.join(BLOCK_UDP_PLUGIN));
                push(&mut args, &["--plugin", &plugin]);
            }
        }
        TargetOs::Linux => {
            if let Some(script) = &input.updown_script {
                let script = path_str(script);
                push(&mut args, &["--up", &script]);
                push(&mut args, &["--down", &script]);
            }
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base<'a>(settings: &'a Settings) -> TunnelArgs<'a> {
        TunnelArgs {
            os: TargetOs::Linux,
            config: Path::new("client.conf.linux"),
            log: Path::new("/var/log/mtunnel/openvpn.1.log"),
            address: Ipv4Addr::new(193, 0, 2, 10),
            port: 1194,
            protocol: Protocol::Udp,
            cipher: Cipher::Aes256,
            cert: Path::new("ssl/7.crt"),
            key: Path::new("ssl/7.key"),
            version: (2, 3),
            settings,
            socks_port: None,
            install_dir: Path::new("/opt/mtunnel"),
            updown_script: None,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let i = args.iter().position(|a| a == flag)?;
        args.get(i + 1).map(String::as_str)
    }

    #[test]
    fn test_parse_version() {
        let out = "OpenVPN 2.4.7 x86_64-pc-linux-gnu [SSL (OpenSSL)] [LZO] built on Feb 20 2019\n";
        assert_eq!(parse_version(out), Some((2, 4)));
        assert_eq!(parse_version("OpenVPN 2.3_git x86_64"), Some((2, 3)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_base_arguments() {
        let settings = Settings::default();
        let args = compose(&base(&settings));

        assert_eq!(&args[..2], &["--config", "client.conf.linux"]);
        assert_eq!(value_after(&args, "--log"), Some("/var/log/mtunnel/openvpn.1.log"));
        let remote = args.iter().position(|a| a == "--remote").unwrap();
        assert_eq!(&args[remote + 1..remote + 3], &["193.0.2.10", "1194"]);
        let mgmt = args.iter().position(|a| a == "--management").unwrap();
        assert_eq!(&args[mgmt + 1..mgmt + 3], &["127.0.0.1", "7505"]);
        assert_eq!(value_after(&args, "--cipher"), Some("AES-256-CBC"));
        assert_eq!(value_after(&args, "--proto"), Some("udp"));
        assert!(!args.iter().any(|a| a == "--pull-filter"));
        assert!(!args.iter().any(|a| a == "--sndbuf"));
    }

    #[test]
    fn test_pull_filter_on_new_versions() {
        let settings = Settings::default();
        let mut input = base(&settings);
        input.version = (2, 4);
        input.protocol = Protocol::Tcp;
        let args = compose(&input);

        assert_eq!(value_after(&args, "--proto"), Some("tcp4"));
        let filters: Vec<&str> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--pull-filter")
            .map(|(i, _)| args[i + 2].as_str())
            .collect();
        assert_eq!(filters, vec!["ifconfig-ipv6 ", "route-ipv6 "]);
    }

    #[test]
    fn test_tunnel_ipv6_wins_over_version() {
        let settings = Settings {
            tunnel_ipv6: true,
            ..Settings::default()
        };
        let mut input = base(&settings);
        input.version = (2, 5);
        let args = compose(&input);

        assert!(args.iter().any(|a| a == "--tun-ipv6"));
        assert_eq!(value_after(&args, "--proto"), Some("udp"));
        assert!(!args.iter().any(|a| a == "--pull-filter"));
    }

    #[test]
    fn test_buffers_proxy_and_custom_args() {
        let settings = Settings {
            send_recv_buffers: BufferSize::Bytes(524288),
            custom_tunnel_args: "--verb 4  --mute 10".to_string(),
            ..Settings::default()
        };
        let mut input = base(&settings);
        input.protocol = Protocol::Obfs2;
        input.socks_port = Some(10194);
        let args = compose(&input);

        assert_eq!(value_after(&args, "--sndbuf"), Some("524288"));
        assert_eq!(value_after(&args, "--rcvbuf"), Some("524288"));
        assert_eq!(value_after(&args, "--proto"), Some("tcp"));
        let proxy = args.iter().position(|a| a == "--socks-proxy").unwrap();
        assert_eq!(&args[proxy + 1..proxy + 3], &["127.0.0.1", "10194"]);
        assert!(args.ends_with(&[
            "--verb".to_string(),
            "4".to_string(),
            "--mute".to_string(),
            "10".to_string()
        ]));
    }

    #[test]
    fn test_windows_extras() {
        let settings = Settings::default();
        let mut input = base(&settings);
        input.os = TargetOs::Windows;
        let args = compose(&input);
        assert!(args.iter().any(|a| a == "--block-outside-dns"));
        assert!(value_after(&args, "--plugin").unwrap().ends_with("block-incoming-udp.dll"));
        assert!(!args.iter().any(|a| a == "--up"));

        let settings = Settings {
            windows_block_outside_dns: false,
            block_incoming_udp: false,
            ..Settings::default()
        };
        let mut input = base(&settings);
        input.os = TargetOs::Windows;
        let args = compose(&input);
        assert!(!args.iter().any(|a| a == "--block-outside-dns" || a == "--plugin"));
    }

    #[test]
    fn test_mac_scripts_only_without_dns_leak_protection() {
        let settings = Settings::default();
        let mut input = base(&settings);
        input.os = TargetOs::Mac;
        assert!(!compose(&input).iter().any(|a| a == "--up"));

        let settings = Settings {
            stop_dns_leaks: false,
            ..Settings::default()
        };
        let mut input = base(&settings);
        input.os = TargetOs::Mac;
        let args = compose(&input);
        assert_eq!(value_after(&args, "--up"), Some(MAC_UP_SCRIPT));
        assert_eq!(value_after(&args, "--down"), Some(MAC_DOWN_SCRIPT));
    }

    #[test]
    fn test_linux_updown_script() {
        let temp_dir = TempDir::new().unwrap();
        let system = temp_dir.path().join("update-resolv-conf");
        let install = temp_dir.path().join("install");
        assert_eq!(updown_script(&system, &install), install.join("update-resolv-conf"));

        std::fs::write(&system, "#!/bin/sh\n").unwrap();
        assert_eq!(updown_script(&system, &install), system);

        let settings = Settings::default();
        let mut input = base(&settings);
        input.updown_script = Some(system.clone());
        let args = compose(&input);
        assert_eq!(value_after(&args, "--up"), system.to_str());
        assert_eq!(value_after(&args, "--down"), system.to_str());
    }
}
