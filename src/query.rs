//! Query-string grammar (spec §4.1): `cmd1=opt1:val1,opt2,opt3:val3&cmd2=opt4`.
//! Commands are positional and may repeat; a fixed set of reserved command
//! names (`load`, `save`) are instead collected into named option bags,
//! with later occurrences overwriting earlier ones.

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;

/// The value half of an `opt` or `opt:val` pair. A bare option name with no
/// `:value` is a flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag,
    Value(String),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Flag => None,
            OptionValue::Value(v) => Some(v),
        }
    }

    pub fn is_flag(&self) -> bool {
        matches!(self, OptionValue::Flag)
    }
}

/// `opt1:val1,opt2,opt3:val3` parsed into a map. Within one bag, a repeated
/// option name is last-writer-wins, matching the original's plain dict
/// assignment (`opts[opt_pair[0]] = opt_pair[1]`).
pub type OptionBag = BTreeMap<String, OptionValue>;

/// The result of parsing a full query string: the ordered, possibly
/// duplicated pipeline of positional commands, plus the reserved `load`/
/// `save` bags (each overwritten, not accumulated, by later occurrences).
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub pipeline: Vec<(String, OptionBag)>,
    pub load: Option<OptionBag>,
    pub save: Option<OptionBag>,
}

const RESERVED: [&str; 2] = ["load", "save"];

/// Parse a raw (not yet percent-decoded) query string, exactly as the
/// original `get_cmds` does: split on `&`, percent-decode each `name=opts`
/// pair, split `opts` on `,` then each piece on the first `:`.
pub fn parse_query(raw_query: &str) -> ParsedQuery {
    let mut result = ParsedQuery::default();

    if raw_query.is_empty() {
        return result;
    }

    for fv_pair in raw_query.split('&') {
        if fv_pair.is_empty() {
            continue;
        }
        let decoded = percent_decode_str(fv_pair).decode_utf8_lossy().into_owned();

        let (oper, opts) = match decoded.split_once('=') {
            Some((oper, all_opts)) => (oper.to_string(), parse_opts(all_opts)),
            None => (decoded, OptionBag::new()),
        };

        if RESERVED.contains(&oper.as_str()) {
            match oper.as_str() {
                "load" => result.load = Some(opts),
                "save" => result.save = Some(opts),
                _ => unreachable!(),
            }
        } else {
            result.pipeline.push((oper, opts));
        }
    }

    result
}

fn parse_opts(all_opts: &str) -> OptionBag {
    let mut opts = OptionBag::new();
    for opt_str in all_opts.split(',') {
        if opt_str.is_empty() {
            continue;
        }
        match opt_str.split_once(':') {
            Some((name, value)) => {
                opts.insert(name.to_string(), OptionValue::Value(value.to_string()));
            }
            None => {
                opts.insert(opt_str.to_string(), OptionValue::Flag);
            }
        }
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_command_with_flags_and_values() {
        let q = parse_query("resize=w:100,h:200,upscale");
        assert_eq!(q.pipeline.len(), 1);
        let (oper, opts) = &q.pipeline[0];
        assert_eq!(oper, "resize");
        assert_eq!(opts.get("w"), Some(&OptionValue::Value("100".to_string())));
        assert_eq!(opts.get("h"), Some(&OptionValue::Value("200".to_string())));
        assert_eq!(opts.get("upscale"), Some(&OptionValue::Flag));
    }

    #[test]
    fn preserves_duplicate_positional_commands() {
        let q = parse_query("crop=n:10&crop=n:20");
        assert_eq!(q.pipeline.len(), 2);
        assert_eq!(q.pipeline[0].0, "crop");
        assert_eq!(q.pipeline[1].0, "crop");
    }

    #[test]
    fn reserved_bags_overwrite_rather_than_accumulate() {
        let q = parse_query("load=post&resize=w:10&load=disk:/tmp/x");
        assert_eq!(q.pipeline.len(), 1);
        let load = q.load.expect("load bag present");
        assert!(load.get("disk").is_some());
        assert!(load.get("post").is_none());
    }

    #[test]
    fn bare_command_has_empty_bag() {
        let q = parse_query("status");
        assert_eq!(q.pipeline.len(), 1);
        assert_eq!(q.pipeline[0].0, "status");
        assert!(q.pipeline[0].1.is_empty());
    }

    #[test]
    fn percent_decodes_values() {
        let q = parse_query("load=disk%3A%2Ftmp%2Fa.jpg");
        let load = q.load.unwrap();
        assert_eq!(
            load.get("disk"),
            Some(&OptionValue::Value("/tmp/a.jpg".to_string()))
        );
    }
}
