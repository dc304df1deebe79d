use crate::protocol::{Heartbeat, InterfaceInfo};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use sysinfo::{Networks, System};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Samples CPU load, SoC temperature and IPv4 interfaces.
///
/// CPU usage is a delta between two refreshes, so keep one sampler alive and
/// call [`HeartbeatSampler::sample`] periodically.
pub struct HeartbeatSampler {
    system: System,
    networks: Networks,
    thermal_path: PathBuf,
}

impl HeartbeatSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            thermal_path: PathBuf::from(THERMAL_ZONE),
        }
    }

    pub fn sample(&mut self) -> Heartbeat {
        self.system.refresh_cpu_usage();
        self.networks.refresh(true);

        let cpu = (self.system.global_cpu_usage() * 10.0).round() / 10.0;

        let mut ifaces: Vec<InterfaceInfo> = self
            .networks
            .iter()
            .flat_map(|(name, data)| {
                data.ip_networks().iter().filter_map(move |net| match net.addr {
                    IpAddr::V4(ip) if !ip.is_loopback() => Some(interface_info(name, ip, net.prefix)),
                    _ => None,
                })
            })
            .collect();
        ifaces.sort_by(|a, b| a.iface.cmp(&b.iface));

        Heartbeat {
            cpu: Some(cpu),
            temp: read_temperature(&self.thermal_path),
            ifaces,
        }
    }
}

impl Default for HeartbeatSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn read_temperature(path: &std::path::Path) -> Option<f32> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_millidegrees(&raw)
}

fn parse_millidegrees(raw: &str) -> Option<f32> {
    let milli: f32 = raw.trim().parse().ok()?;
    Some((milli / 100.0).round() / 10.0)
}

fn interface_info(name: &str, ip: Ipv4Addr, prefix: u8) -> InterfaceInfo {
    let prefix = prefix.min(32);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = Ipv4Addr::from(u32::from(ip) & mask);
    InterfaceInfo {
        iface: Some(name.to_string()),
        ip: Some(ip.to_string()),
        prefix: Some(prefix),
        cidr: Some(format!("{network}/{prefix}")),
    }
}

/// Preferred address to show for this device: wireless first.
pub fn primary_ip(heartbeat: &Heartbeat) -> Option<&str> {
    let wireless = heartbeat
        .ifaces
        .iter()
        .filter(|i| i.iface.as_deref().is_some_and(|n| n.starts_with("wl")));
    wireless
        .chain(heartbeat.ifaces.iter())
        .find_map(|i| i.ip.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_uses_network_address() {
        let info = interface_info("wlan0", Ipv4Addr::new(192, 168, 1, 37), 24);
        assert_eq!(info.cidr.as_deref(), Some("192.168.1.0/24"));
        assert_eq!(info.ip.as_deref(), Some("192.168.1.37"));

        let info = interface_info("eth0", Ipv4Addr::new(10, 1, 2, 3), 0);
        assert_eq!(info.cidr.as_deref(), Some("0.0.0.0/0"));
    }

    #[test]
    fn temperature_in_degrees() {
        assert_eq!(parse_millidegrees("48312\n"), Some(48.3));
        assert_eq!(parse_millidegrees("garbage"), None);
    }

    #[test]
    fn primary_ip_prefers_wireless() {
        let heartbeat = Heartbeat {
            cpu: None,
            temp: None,
            ifaces: vec![
                interface_info("eth0", Ipv4Addr::new(10, 0, 0, 5), 24),
                interface_info("wlan0", Ipv4Addr::new(192, 168, 4, 9), 24),
            ],
        };
        assert_eq!(primary_ip(&heartbeat), Some("192.168.4.9"));
        assert_eq!(primary_ip(&Heartbeat::default()), None);
    }

    #[test]
    fn sampler_reports_cpu() {
        let mut sampler = HeartbeatSampler::new();
        let heartbeat = sampler.sample();
        assert!(heartbeat.cpu.is_some());
        assert!(heartbeat.ifaces.iter().all(|i| i.ip.as_deref() != Some("127.0.0.1")));
    }
}
