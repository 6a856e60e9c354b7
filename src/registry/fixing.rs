//! Fix lists: hold maps constant by name pattern.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::{debug, info};

use super::TransformRegistry;
use crate::error::Result;

impl TransformRegistry {
    /// Fix every map whose name matches one of `patterns`.
    ///
    /// Patterns are regular expressions matched against the whole name. A
    /// pattern that matches an instrument name (a key of `instruments`) also
    /// fixes every map called `<instrument>/<device>` for that instrument's
    /// devices. Returns the names that were fixed, sorted.
    pub fn fix_matching<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
        instruments: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<String>> {
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p.as_ref())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let hit = |name: &str| regexes.iter().any(|re| re.is_match(name));

        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter(|n| hit(n))
            .cloned()
            .collect();

        for (instrument, devices) in instruments {
            if !hit(instrument) {
                continue;
            }
            debug!("Fixing all devices of instrument {}", instrument);
            for device in devices {
                let name = format!("{instrument}/{device}");
                if self.entries.contains_key(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        names.dedup();

        if !names.is_empty() {
            self.set_fixed(&names)?;
            info!("Fixed {} maps from fix list", names.len());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::MapShape;

    fn registry() -> TransformRegistry {
        let mut reg = TransformRegistry::new();
        for name in ["DECam/N1", "DECam/N2", "DECam", "Mosaic/S1", "D0042", "D0043", "Gaia"] {
            reg.learn_atomic(name, MapShape::Linear, Some(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]))
                .unwrap();
        }
        reg.learn_composite("D0042/N1", vec!["DECam/N1".into(), "D0042".into()])
            .unwrap();
        reg.rebuild_parameter_vector();
        reg
    }

    #[test]
    fn test_patterns_are_anchored() {
        let mut reg = registry();
        let fixed = reg.fix_matching(&["D004.", "Gaia"], &BTreeMap::new()).unwrap();
        assert_eq!(fixed, vec!["D0042", "D0043", "Gaia"]);
        // "D004." must not match "D0042/N1" as a prefix.
        assert!(!reg.is_fixed("DECam/N1").unwrap());
        assert!(reg.is_fixed("D0043").unwrap());
    }

    #[test]
    fn test_instrument_expansion() {
        let mut reg = registry();
        let mut instruments = BTreeMap::new();
        instruments.insert(
            "DECam".to_string(),
            vec!["N1".to_string(), "N2".to_string(), "N3".to_string()],
        );
        let fixed = reg.fix_matching(&["DECam"], &instruments).unwrap();
        assert_eq!(fixed, vec!["DECam", "DECam/N1", "DECam/N2"]);
        assert!(reg.is_fixed("DECam/N2").unwrap());
        assert!(!reg.is_fixed("Mosaic/S1").unwrap());
        assert!(!reg.is_fixed("D0042/N1").unwrap());
    }

    #[test]
    fn test_bad_pattern() {
        let mut reg = registry();
        assert!(matches!(
            reg.fix_matching(&["(unclosed"], &BTreeMap::new()),
            Err(crate::error::FitError::Pattern(_))
        ));
    }
}
