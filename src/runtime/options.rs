use std::num::ParseIntError;

use crate::heap::constants::MAX_HEAP_SIZE;

fn parse_size_from_osstr(s: &str) -> Result<usize, ParseIntError> {
    let s = s.to_lowercase();
    let (number, unit) = s.split_at(s.find(|c: char| !c.is_digit(10)).unwrap_or(s.len()));
    let multiplier = match unit {
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => 1,
    };

    number
        .parse::<usize>()
        .map_err(|x| x.into())
        .map(|x| x * multiplier)
}
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "meteor", about = "Runtime memory manager for the Meteor language")]
pub struct Options {
    #[structopt(
        long = "reserve-size",
        help = "Address space ceiling reserved for the heap",
        default_value = "64GB",
        parse(try_from_str=parse_size_from_osstr)
    )]
    pub reserve_size: usize,
    #[structopt(
        long = "gc-latency",
        help = "Incremental collection deadline in milliseconds",
        default_value = "50"
    )]
    pub gc_latency: u64,
    #[structopt(long = "gc-verbose", help = "Enable verbose GC logging")]
    pub verbose_gc: bool,
    #[structopt(long = "gc-stats", help = "Print collection statistics on exit")]
    pub gc_stats: bool,
    #[structopt(long = "stack-size", help = "Value stack capacity in slots")]
    pub stack_size: Option<usize>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            reserve_size: MAX_HEAP_SIZE,
            gc_latency: 50,
            verbose_gc: false,
            gc_stats: false,
            stack_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size_from_osstr("512").unwrap(), 512);
        assert_eq!(parse_size_from_osstr("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size_from_osstr("2mb").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_from_osstr("64GB").unwrap(), MAX_HEAP_SIZE);
    }
}
