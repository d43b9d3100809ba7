use super::{LocalFilter, MetaProperty, MetaQuery};
use crate::catalog::types::Kind;
use crate::error::KindbError;
use serde::Serialize;
use sha2::{Digest, Sha256};

// Result-affecting subset of a meta query. Field order is part of the
// encoding; appending a field changes every fingerprint.
#[derive(Serialize)]
struct ResultShape<'a> {
    kind: Kind,
    class_name: &'a str,
    filters: Option<&'a LocalFilter>,
    include_meta_count: bool,
    properties: &'a [MetaProperty],
}

/// Hex-encoded SHA-256 over the MessagePack encoding of the query's
/// result-affecting parameters. Stable across processes; statistic order
/// is significant.
pub fn analytics_hash(query: &MetaQuery) -> Result<String, KindbError> {
    let shape = ResultShape {
        kind: query.kind,
        class_name: &query.class_name,
        filters: query.filters.as_ref(),
        include_meta_count: query.include_meta_count,
        properties: &query.properties,
    };
    let bytes = rmp_serde::to_vec(&shape).map_err(|e| KindbError::Encode(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::Scalar;
    use crate::query::{AnalyticsProps, Clause, StatisticalAnalysis};
    use proptest::prelude::*;

    fn best_class_query() -> MetaQuery {
        MetaQuery {
            kind: Kind::Thing,
            class_name: "MyBestClass".into(),
            filters: None,
            include_meta_count: true,
            properties: vec![MetaProperty::new(
                "bestprop",
                vec![StatisticalAnalysis::Count],
            )],
            analytics: AnalyticsProps {
                use_analytics_engine: true,
                force_recalculate: false,
            },
        }
    }

    #[test]
    fn hash_is_fixed_length_hex_and_repeatable() {
        let first = analytics_hash(&best_class_query()).expect("hash");
        let second = analytics_hash(&best_class_query()).expect("hash");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn force_recalculate_does_not_change_hash() {
        let base = analytics_hash(&best_class_query()).expect("hash");
        let mut forced = best_class_query();
        forced.analytics.force_recalculate = true;
        assert_eq!(analytics_hash(&forced).expect("hash"), base);
    }

    #[test]
    fn changed_statistic_changes_hash() {
        let base = analytics_hash(&best_class_query()).expect("hash");
        let mut query = best_class_query();
        query.properties[0].statistical_analyses[0] = StatisticalAnalysis::Maximum;
        assert_ne!(analytics_hash(&query).expect("hash"), base);
    }

    #[test]
    fn added_where_filter_changes_hash() {
        let base = analytics_hash(&best_class_query()).expect("hash");
        let mut query = best_class_query();
        query.filters = Some(LocalFilter {
            root: Clause::value(Scalar::Text("foo".into())),
        });
        assert_ne!(analytics_hash(&query).expect("hash"), base);
    }

    #[test]
    fn statistic_order_is_significant() {
        let mut a = best_class_query();
        a.properties[0].statistical_analyses =
            vec![StatisticalAnalysis::Count, StatisticalAnalysis::Mean];
        let mut b = best_class_query();
        b.properties[0].statistical_analyses =
            vec![StatisticalAnalysis::Mean, StatisticalAnalysis::Count];
        assert_ne!(
            analytics_hash(&a).expect("hash"),
            analytics_hash(&b).expect("hash")
        );
    }

    fn statistic() -> impl Strategy<Value = StatisticalAnalysis> {
        prop_oneof![
            Just(StatisticalAnalysis::Count),
            Just(StatisticalAnalysis::Sum),
            Just(StatisticalAnalysis::Mean),
            Just(StatisticalAnalysis::Maximum),
            Just(StatisticalAnalysis::Minimum),
            Just(StatisticalAnalysis::TopOccurrences),
            Just(StatisticalAnalysis::PercentageTrue),
        ]
    }

    proptest! {
        #[test]
        fn execution_flags_never_affect_hash(
            class_name in "[A-Z][a-zA-Z0-9]{0,12}",
            property in "[a-z][a-zA-Z0-9]{0,12}",
            stats in proptest::collection::vec(statistic(), 0..5),
            include_meta_count in any::<bool>(),
            use_engine in any::<bool>(),
            force in any::<bool>(),
        ) {
            let query = MetaQuery {
                kind: Kind::Action,
                class_name,
                filters: None,
                include_meta_count,
                properties: vec![MetaProperty::new(property, stats)],
                analytics: AnalyticsProps::default(),
            };
            let mut flagged = query.clone();
            flagged.analytics = AnalyticsProps {
                use_analytics_engine: use_engine,
                force_recalculate: force,
            };
            prop_assert_eq!(analytics_hash(&query).unwrap(), analytics_hash(&flagged).unwrap());
        }

        #[test]
        fn class_name_changes_hash(a in "[A-Z][a-z]{1,8}", b in "[A-Z][a-z]{1,8}") {
            prop_assume!(a != b);
            let mut qa = best_class_query();
            qa.class_name = a;
            let mut qb = best_class_query();
            qb.class_name = b;
            prop_assert_ne!(analytics_hash(&qa).unwrap(), analytics_hash(&qb).unwrap());
        }
    }
}
