//! The human-readable diagnostic listing.

use std::fmt::Write as _;

use hbmon_core::constants::{MAX_WINDOWS, MEASURE_SCALE};

use crate::attach::HeartRateMonitor;

impl HeartRateMonitor {
    /// Render every live group: members, goal, and current rates.
    /// Windows without enough history yet are left out.
    pub fn report(&self) -> String {
        let groups = self.registry().lock();
        let mut out = String::new();
        let _ = write!(out, "{} monitored groups found:", groups.len());
        if groups.is_empty() {
            out.push('\n');
        }

        for group in groups.iter() {
            let _ = write!(out, "\n\ngid: {}\ntids:", group.gid());
            for tid in group.used_tids() {
                let _ = write!(out, " {tid}");
            }
            let (min, scope) = group.min_heart_rate();
            let (max, _) = group.max_heart_rate();
            let global = group.heart_rate(0).map(|(hr, _)| hr).unwrap_or(0);
            let _ = write!(
                out,
                "\nminimum heart rate: {min} [hb/{MEASURE_SCALE} / s]\n\
                 maximum heart rate: {max} [hb/{MEASURE_SCALE} / s]\n\
                 goal scope: {scope}\n\
                 \tglobal heart rate: {global} [hb/{MEASURE_SCALE} / s]\n"
            );
            for key in 1..=MAX_WINDOWS {
                if let Ok((hr, ws)) = group.heart_rate(key) {
                    let _ = write!(
                        out,
                        "window {key}\n\
                         \twindow heart rate: {hr} [hb/{MEASURE_SCALE} / s]\n\
                         \twindow size: {ws}\n"
                    );
                }
            }
        }
        out
    }
}
