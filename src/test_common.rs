#![cfg(test)]

use std::cell::Cell;
use std::collections::HashMap;

use maplit::hashmap;
use serde_json::{json, Value};

use crate::big_segments::{BigSegmentMembership, BigSegmentProvider, BigSegmentsStatus};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::store::Store;

#[derive(Default)]
pub struct TestStore {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

fn boolean_flag(key: &str, extra: Value) -> Value {
    let mut flag = json!({
        "key": key,
        "version": 42,
        "on": true,
        "fallthrough": {"variation": 0},
        "offVariation": 0,
        "variations": [false, true],
        "salt": "salty"
    });
    merge(&mut flag, extra);
    flag
}

fn string_flag(key: &str, variations: &[&str], extra: Value) -> Value {
    let mut flag = boolean_flag(key, json!({"variations": variations}));
    merge(&mut flag, extra);
    flag
}

fn merge(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        target.extend(extra);
    }
}

fn segment_match_rule(id: &str, segment_keys: &[&str], variation: usize) -> Value {
    json!({
        "id": id,
        "clauses": [{"attribute": "key", "op": "segmentMatch", "values": segment_keys}],
        "variation": variation
    })
}

fn experiment_rollout(extra: Value) -> Value {
    let mut rollout = json!({
        "kind": "experiment",
        "seed": 61,
        "variations": [
            {"variation": 0, "weight": 10000, "untracked": false},
            {"variation": 1, "weight": 20000, "untracked": false},
            {"variation": 0, "weight": 70000, "untracked": true}
        ]
    });
    merge(&mut rollout, extra);
    rollout
}

fn sixty_forty_rollout(extra: Value) -> Value {
    let mut rollout = json!({
        "variations": [
            {"variation": 0, "weight": 60000},
            {"variation": 1, "weight": 40000}
        ]
    });
    merge(&mut rollout, extra);
    rollout
}

// Variations are "<name>-off" and "<name>-on"; the fallthrough serves the latter.
fn prerequisite_flag(key: &str, name: &str, prerequisites: Value) -> Value {
    let off = format!("{}-off", name);
    let on = format!("{}-on", name);
    string_flag(
        key,
        &[off.as_str(), on.as_str()],
        json!({"prerequisites": prerequisites, "fallthrough": {"variation": 1}}),
    )
}

impl TestStore {
    /// A store holding the flags and segments the evaluation tests refer to.
    pub fn new() -> Self {
        let flags: HashMap<&str, Value> = hashmap! {
            "flag" => boolean_flag("flag", json!({
                "on": false,
                "fallthrough": {"variation": 1},
                "clientSide": true,
                "clientSideAvailability": {"usingEnvironmentId": true, "usingMobileKey": true}
            })),
            "flagWithTrackedRule" => boolean_flag("flagWithTrackedRule", json!({
                "rules": [{
                    "id": "rule-id",
                    "clauses": [{"attribute": "key", "op": "in", "values": ["alice"]}],
                    "variation": 1,
                    "trackEvents": true
                }],
                "trackEventsFallthrough": true,
                "debugEventsUntilDate": 1500000000u64
            })),
            "flagWithTarget" => boolean_flag("flagWithTarget", json!({
                "on": false,
                "targets": [{"values": ["bob"], "variation": 0}],
                "fallthrough": {"variation": 1}
            })),
            "flagWithContextTargets" => string_flag(
                "flagWithContextTargets",
                &["fallthrough", "user-target", "org-target"],
                json!({
                    "targets": [
                        {"values": ["alice"], "variation": 1},
                        {"values": ["carol"], "variation": 2}
                    ],
                    "contextTargets": [
                        {"contextKind": "org", "values": ["acme"], "variation": 2},
                        {"contextKind": "user", "values": [], "variation": 1}
                    ]
                }),
            ),
            "flagWithRules" => string_flag(
                "flagWithRules",
                &["fallthrough", "groups", "org", "off"],
                json!({
                    "offVariation": 3,
                    "rules": [
                        {
                            "id": "rule-groups",
                            "clauses": [{"attribute": "groups", "op": "matches", "values": ["^my-"]}],
                            "variation": 1
                        },
                        {
                            "id": "rule-kind",
                            "clauses": [{"attribute": "kind", "op": "in", "values": ["org"]}],
                            "variation": 2
                        }
                    ]
                }),
            ),
            "flagWithNegatedClause" => boolean_flag("flagWithNegatedClause", json!({
                "rules": [{
                    "id": "not-gold",
                    "clauses": [{"attribute": "plan", "op": "in", "values": ["gold"], "negate": true}],
                    "variation": 1
                }]
            })),
            "flagWithBadOffVariation" => boolean_flag("flagWithBadOffVariation", json!({
                "on": false,
                "offVariation": 999
            })),
            "flagWithMalformedFallthrough" => boolean_flag("flagWithMalformedFallthrough", json!({
                "fallthrough": {"variation": null, "rollout": null}
            })),
            "flagWithMalformedRule" => boolean_flag("flagWithMalformedRule", json!({
                "rules": [{
                    "id": "no-variation",
                    "clauses": [{"attribute": "key", "op": "in", "values": ["yes"]}]
                }],
                "fallthrough": {"variation": 1}
            })),
            "flagWithRuleOutOfRange" => boolean_flag("flagWithRuleOutOfRange", json!({
                "rules": [{"id": "everyone", "clauses": [], "variation": 5}]
            })),
            "flagWithRollout" => string_flag("hashKey", &["first", "second"], json!({
                "salt": "saltyA",
                "fallthrough": {"rollout": sixty_forty_rollout(json!({}))}
            })),
            "flagWithOrgRollout" => string_flag("hashKey", &["first", "second"], json!({
                "salt": "saltyA",
                "fallthrough": {"rollout": sixty_forty_rollout(json!({
                    "contextKind": "org",
                    "bucketBy": "bucketKey"
                }))}
            })),
            "flagWithExperiment" => boolean_flag("flagWithExperiment", json!({
                "fallthrough": {"rollout": experiment_rollout(json!({}))}
            })),
            "flagWithExperimentTargetingContext" => boolean_flag("flagWithExperimentTargetingContext", json!({
                "fallthrough": {"rollout": experiment_rollout(json!({"contextKind": "org"}))}
            })),
            "prereqA" => prerequisite_flag("prereqA", "a", json!([{"key": "prereqB", "variation": 1}])),
            "prereqB" => prerequisite_flag("prereqB", "b", json!([{"key": "prereqC", "variation": 1}])),
            "prereqC" => prerequisite_flag("prereqC", "c", json!([])),
            "offFlag" => boolean_flag("offFlag", json!({"on": false, "offVariation": 1})),
            "flagWithMissingPrereq" => boolean_flag("flagWithMissingPrereq", json!({
                "prerequisites": [{"key": "missing", "variation": 1}],
                "fallthrough": {"variation": 1}
            })),
            "flagWithOffPrereq" => boolean_flag("flagWithOffPrereq", json!({
                "prerequisites": [{"key": "offFlag", "variation": 1}],
                "fallthrough": {"variation": 1}
            })),
            "flagWithTwoPrereqs" => boolean_flag("flagWithTwoPrereqs", json!({
                "prerequisites": [
                    {"key": "prereqC", "variation": 1},
                    {"key": "offFlag", "variation": 1},
                    {"key": "prereqB", "variation": 1}
                ]
            })),
            "flagWithDiamondPrereqs" => boolean_flag("flagWithDiamondPrereqs", json!({
                "prerequisites": [
                    {"key": "prereqB", "variation": 1},
                    {"key": "prereqC", "variation": 1}
                ]
            })),
            "cycleA" => boolean_flag("cycleA", json!({"prerequisites": [{"key": "cycleB", "variation": 0}]})),
            "cycleB" => boolean_flag("cycleB", json!({"prerequisites": [{"key": "cycleA", "variation": 0}]})),
            "cycleSelf" => boolean_flag("cycleSelf", json!({"prerequisites": [{"key": "cycleSelf", "variation": 0}]})),
            "cycleX" => boolean_flag("cycleX", json!({"prerequisites": [{"key": "cycleY", "variation": 0}]})),
            "cycleY" => boolean_flag("cycleY", json!({"prerequisites": [{"key": "cycleZ", "variation": 0}]})),
            "cycleZ" => boolean_flag("cycleZ", json!({"prerequisites": [{"key": "cycleX", "variation": 0}]})),
            "flagWithSegmentMatch" => boolean_flag("flagWithSegmentMatch", json!({
                "rules": [segment_match_rule("rule", &["segIncludesAlice"], 1)]
            })),
            "prereqWithSegment" => boolean_flag("prereqWithSegment", json!({
                "rules": [segment_match_rule("rule", &["segIncludesAlice"], 1)]
            })),
            "flagSharingSegmentWithPrereq" => boolean_flag("flagSharingSegmentWithPrereq", json!({
                "prerequisites": [{"key": "prereqWithSegment", "variation": 1}],
                "rules": [segment_match_rule("rule", &["segIncludesAlice"], 1)]
            })),
        };

        let segments: HashMap<&str, Value> = hashmap! {
            "segIncludesAlice" => json!({"key": "segIncludesAlice", "included": ["alice"], "salt": "salty"}),
            "segIncludesSegment" => json!({
                "key": "segIncludesSegment",
                "rules": [{"clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["segIncludesAlice"]}]}]
            }),
            "segA" => json!({
                "key": "segA",
                "rules": [{"clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["segB"]}]}]
            }),
            "segB" => json!({
                "key": "segB",
                "rules": [{"clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["segA"]}]}]
            }),
            "segSelf" => json!({
                "key": "segSelf",
                "rules": [{"clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["segSelf"]}]}]
            }),
            "bigSeg" => json!({"key": "bigSeg", "unbounded": true, "generation": 1}),
            "bigSegNoGeneration" => json!({"key": "bigSegNoGeneration", "unbounded": true}),
        };

        Self {
            flags: flags
                .into_iter()
                .map(|(name, flag)| (name.to_string(), serde_json::from_value(flag).unwrap()))
                .collect(),
            segments: segments
                .into_iter()
                .map(|(name, segment)| (name.to_string(), serde_json::from_value(segment).unwrap()))
                .collect(),
        }
    }

    /// Adds or replaces a flag, stored under its own key.
    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag.key.clone(), flag);
        self
    }
}

impl Store for TestStore {
    fn flag(&self, flag_key: &str) -> Option<&Flag> {
        self.flags.get(flag_key)
    }

    fn segment(&self, segment_key: &str) -> Option<&Segment> {
        self.segments.get(segment_key)
    }
}

/// Answers membership queries from fixed data and counts how often it is asked.
pub struct TestBigSegmentProvider {
    status: BigSegmentsStatus,
    memberships: HashMap<String, HashMap<String, bool>>,
    queries: Cell<usize>,
}

impl TestBigSegmentProvider {
    pub fn new(status: BigSegmentsStatus) -> Self {
        Self {
            status,
            memberships: HashMap::new(),
            queries: Cell::new(0),
        }
    }

    pub fn with_membership(mut self, context_key: &str, segments: &[(&str, bool)]) -> Self {
        self.memberships.insert(
            context_key.to_string(),
            segments
                .iter()
                .map(|(segment_ref, included)| (segment_ref.to_string(), *included))
                .collect(),
        );
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.get()
    }
}

struct TestMembership(HashMap<String, bool>);

impl BigSegmentMembership for TestMembership {
    fn check_membership(&self, segment_ref: &str) -> Option<bool> {
        self.0.get(segment_ref).copied()
    }
}

impl BigSegmentProvider for TestBigSegmentProvider {
    fn membership(
        &self,
        context_key: &str,
    ) -> (Option<Box<dyn BigSegmentMembership>>, BigSegmentsStatus) {
        self.queries.set(self.queries.get() + 1);
        let membership = self
            .memberships
            .get(context_key)
            .map(|m| Box::new(TestMembership(m.clone())) as Box<dyn BigSegmentMembership>);
        (membership, self.status)
    }
}
