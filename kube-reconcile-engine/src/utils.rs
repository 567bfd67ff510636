/// Prefix `name` with the namespace of all metrics exported by this crate.
pub(crate) fn metric_name(name: &str) -> String {
    format!("reconcile_engine_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        assert_eq!("reconcile_engine_reconcile_count", metric_name("reconcile_count"));
    }
}
