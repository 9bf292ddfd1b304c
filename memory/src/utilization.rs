use colorful::{core::color_string::CString, Color, Colorful as _};

/// Heap usage snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Heap label.
    pub label: String,

    /// Bytes held by allocations, including frees still waiting for the GPU.
    pub total_allocated: u64,

    /// Number of allocations, including frees still waiting for the GPU.
    pub num_allocations: u64,

    /// Bytes of backing memory held, cached pages included.
    pub total_mem_usage: u64,

    /// Pages held, cached pages included.
    pub num_pages: u64,
}

impl HeapReport {
    /// Allocated share of the held memory in 1/10000 units.
    pub fn permyriad(&self) -> u64 {
        if self.total_mem_usage == 0 {
            0
        } else {
            self.total_allocated * 10000 / self.total_mem_usage
        }
    }
}

impl std::fmt::Display for HeapReport {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MB: u64 = 1024 * 1024;

        let permyriad = self.permyriad();
        let fill = (permyriad.min(10000) / 200) as usize;
        let line = ("|".repeat(fill) + &(" ".repeat(50 - fill)))
            .gradient_with_color(Color::Green, Color::Red);

        writeln!(
            fmt,
            "Heap {}:\n{:6} / {:<6} or{} in {} allocations on {} pages [{}]",
            self.label.clone().magenta(),
            format!("{}MB", self.total_allocated / MB),
            format!("{}MB", self.total_mem_usage / MB),
            format_permyriad(permyriad),
            self.num_allocations,
            self.num_pages,
            line
        )
    }
}

fn format_permyriad(permyriad: u64) -> CString {
    debug_assert!(permyriad <= 10000);
    let s = format!("{:>3}.{:02}%", permyriad / 100, permyriad % 100);
    if permyriad > 7500 {
        s.red()
    } else if permyriad > 5000 {
        s.yellow()
    } else if permyriad > 2500 {
        s.green()
    } else if permyriad > 100 {
        s.blue()
    } else {
        s.white()
    }
}
