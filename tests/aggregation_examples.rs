//! End-to-end aggregation scenarios run through the public API.
//!
//! Covers: filtered top subset, multi-field one-to-many join, array sort
//! and percentiles, windowed running totals, unwind edge cases, sort-then-
//! limit laziness and unknown-operator errors.

use serde_json::json;

use oxiflow::{aggregate, Error, Lazy, OperatorCategory, Options, Pipeline, Value};

// ---------------------------------------------------------------------------
// Test infrastructure
// ---------------------------------------------------------------------------

fn v(j: serde_json::Value) -> Value {
    Value::from(j)
}

fn docs(items: serde_json::Value) -> Vec<Value> {
    match v(items) {
        Value::Array(items) => items,
        other => panic!("fixture must be an array, got {other}"),
    }
}

fn run(input: serde_json::Value, pipeline: serde_json::Value) -> Vec<Value> {
    aggregate(docs(input), &v(pipeline), &Options::default()).expect("pipeline failed")
}

fn persons() -> serde_json::Value {
    json!([
        {
            "person_id": "6392529400", "firstname": "Elise", "lastname": "Smith",
            "dateofbirth": {"$date": "1972-01-13T09:32:07Z"}, "vocation": "ENGINEER",
            "address": {"number": 5625, "street": "Tipa Circle", "city": "Wojzinmoj"}
        },
        {
            "person_id": "1723338115", "firstname": "Olive", "lastname": "Ranieri",
            "dateofbirth": {"$date": "1985-05-12T23:14:30Z"}, "gender": "FEMALE", "vocation": "ENGINEER",
            "address": {"number": 9303, "street": "Mele Circle", "city": "Tobihbo"}
        },
        {
            "person_id": "8732762874", "firstname": "Toni", "lastname": "Jones",
            "dateofbirth": {"$date": "1991-11-23T16:53:56Z"}, "vocation": "POLITICIAN",
            "address": {"number": 1, "street": "High Street", "city": "Upper Abbeywoodington"}
        },
        {
            "person_id": "7363629563", "firstname": "Bert", "lastname": "Gooding",
            "dateofbirth": {"$date": "1941-04-07T22:11:52Z"}, "vocation": "FLORIST",
            "address": {"number": 13, "street": "Upper Bold Road", "city": "Redringtonville"}
        },
        {
            "person_id": "1029648329", "firstname": "Sophie", "lastname": "Celements",
            "dateofbirth": {"$date": "1959-07-06T17:35:45Z"}, "vocation": "ENGINEER",
            "address": {"number": 5, "street": "Innings Close", "city": "Basilbridge"}
        },
        {
            "person_id": "7363626383", "firstname": "Carl", "lastname": "Simmons",
            "dateofbirth": {"$date": "1998-12-26T13:13:55Z"}, "vocation": "ENGINEER",
            "address": {"number": 187, "street": "Hillside Road", "city": "Kenningford"}
        }
    ])
}

// ---------------------------------------------------------------------------
// Foundational
// ---------------------------------------------------------------------------

#[test]
fn three_youngest_engineers() {
    let out = run(
        persons(),
        json!([
            {"$match": {"vocation": "ENGINEER"}},
            {"$sort": {"dateofbirth": -1}},
            {"$limit": 3},
            {"$unset": ["_id", "vocation", "address"]}
        ]),
    );
    assert_eq!(
        out,
        docs(json!([
            {"person_id": "7363626383", "firstname": "Carl", "lastname": "Simmons",
             "dateofbirth": {"$date": "1998-12-26T13:13:55.000Z"}},
            {"person_id": "1723338115", "firstname": "Olive", "lastname": "Ranieri",
             "dateofbirth": {"$date": "1985-05-12T23:14:30.000Z"}, "gender": "FEMALE"},
            {"person_id": "6392529400", "firstname": "Elise", "lastname": "Smith",
             "dateofbirth": {"$date": "1972-01-13T09:32:07.000Z"}}
        ]))
    );
}

#[test]
fn group_people_by_vocation() {
    let out = run(
        persons(),
        json!([
            {"$group": {"_id": "$vocation", "people": {"$push": "$firstname"}, "n": {"$count": {}}}},
            {"$sort": {"n": -1, "_id": 1}}
        ]),
    );
    assert_eq!(
        out,
        docs(json!([
            {"_id": "ENGINEER", "people": ["Elise", "Olive", "Sophie", "Carl"], "n": 4},
            {"_id": "FLORIST", "people": ["Bert"], "n": 1},
            {"_id": "POLITICIAN", "people": ["Toni"], "n": 1}
        ]))
    );
}

// ---------------------------------------------------------------------------
// Joining
// ---------------------------------------------------------------------------

#[test]
fn multi_field_join_one_to_many() {
    let products = json!([
        {"id": "a1b2c3d4", "name": "Asus Laptop", "category": "ELECTRONICS"},
        {"id": "z9y8x7w6", "name": "The Day Of The Triffids", "category": "BOOKS"},
        {"id": "ff11gg22hh33", "name": "Morphy Richardds Food Mixer", "category": "KITCHENWARE"},
        {"id": "pqr678st", "name": "Karcher Hose Set", "category": "GARDEN"}
    ]);
    let orders = json!([
        {"customer_id": "elise_smith@myemail.com", "orderdate": {"$date": "2020-05-30T08:35:52Z"},
         "product_id": "a1b2c3d4", "value": 431.43},
        {"customer_id": "tj@wheresmyemail.com", "orderdate": {"$date": "2019-05-28T19:13:32Z"},
         "product_id": "z9y8x7w6", "value": 5.01},
        {"customer_id": "oranieri@warmmail.com", "orderdate": {"$date": "2020-01-01T08:25:37Z"},
         "product_id": "ff11gg22hh33", "value": 63.13},
        {"customer_id": "jjones@tepidmail.com", "orderdate": {"$date": "2020-12-26T08:55:46Z"},
         "product_id": "a1b2c3d4", "value": 429.65}
    ]);

    let resolved = docs(products);
    let options = Options::default()
        .with_collection_resolver(move |name| (name == "products").then(|| resolved.clone()));
    let pipeline = v(json!([
        {"$match": {"orderdate": {
            "$gte": {"$date": "2020-01-01T00:00:00Z"},
            "$lt": {"$date": "2021-01-01T00:00:00Z"}
        }}},
        {"$lookup": {"from": "products", "localField": "product_id", "foreignField": "id", "as": "product_mapping"}},
        {"$set": {"product_mapping": {"$first": "$product_mapping"}}},
        {"$set": {"product_name": "$product_mapping.name", "product_category": "$product_mapping.category"}},
        {"$unset": ["_id", "product_id", "product_mapping"]}
    ]));

    let out = aggregate(docs(orders), &pipeline, &options).unwrap();
    assert_eq!(
        out,
        docs(json!([
            {"customer_id": "elise_smith@myemail.com", "orderdate": {"$date": "2020-05-30T08:35:52Z"},
             "value": 431.43, "product_name": "Asus Laptop", "product_category": "ELECTRONICS"},
            {"customer_id": "oranieri@warmmail.com", "orderdate": {"$date": "2020-01-01T08:25:37Z"},
             "value": 63.13, "product_name": "Morphy Richardds Food Mixer", "product_category": "KITCHENWARE"},
            {"customer_id": "jjones@tepidmail.com", "orderdate": {"$date": "2020-12-26T08:55:46Z"},
             "value": 429.65, "product_name": "Asus Laptop", "product_category": "ELECTRONICS"}
        ]))
    );
}

// ---------------------------------------------------------------------------
// Array manipulation
// ---------------------------------------------------------------------------

/// Insertion sort written with `$reduce`, `$let`, `$slice` and friends.
fn sort_array(source: &str) -> serde_json::Value {
    json!({"$reduce": {
        "input": source,
        "initialValue": [],
        "in": {"$let": {
            "vars": {"resultArray": "$$value", "currentSourceArrayElement": "$$this"},
            "in": {"$let": {
                "vars": {"targetArrayPosition": {"$reduce": {
                    "input": {"$range": [0, {"$size": "$$resultArray"}]},
                    "initialValue": {"$size": "$$resultArray"},
                    "in": {"$cond": [
                        {"$lt": ["$$currentSourceArrayElement", {"$arrayElemAt": ["$$resultArray", "$$this"]}]},
                        {"$min": ["$$value", "$$this"]},
                        "$$value"
                    ]}
                }}},
                "in": {"$concatArrays": [
                    {"$cond": [
                        {"$eq": [0, "$$targetArrayPosition"]},
                        [],
                        {"$slice": ["$$resultArray", 0, "$$targetArrayPosition"]}
                    ]},
                    ["$$currentSourceArrayElement"],
                    {"$cond": [
                        {"$gt": [{"$size": "$$resultArray"}, 0]},
                        {"$slice": ["$$resultArray", "$$targetArrayPosition", {"$size": "$$resultArray"}]},
                        []
                    ]}
                ]}
            }}
        }}
    }})
}

fn percentile(source: &str, pct: i64) -> serde_json::Value {
    json!({"$let": {
        "vars": {"sortedArray": sort_array(source)},
        "in": {"$arrayElemAt": [
            "$$sortedArray",
            {"$subtract": [
                {"$ceil": {"$multiply": [{"$divide": [pct, 100]}, {"$size": "$$sortedArray"}]}},
                1
            ]}
        ]}
    }})
}

#[test]
fn array_sort_and_percentiles() {
    let results = json!([
        {"testRun": 1, "datetime": {"$date": "2021-08-01T22:51:27.638Z"},
         "responseTimesMillis": [62, 97, 59, 104, 97, 71, 62, 115, 82, 87]},
        {"testRun": 2, "datetime": {"$date": "2021-08-01T22:56:32.272Z"},
         "responseTimesMillis": [34, 63, 51, 104, 87, 63, 64, 86, 105, 51, 73, 78, 59, 108, 65, 58, 69, 106, 87, 93, 65]},
        {"testRun": 3, "datetime": {"$date": "2021-08-01T23:01:08.908Z"},
         "responseTimesMillis": [56, 72, 83, 95, 107, 83, 85]},
        {"testRun": 4, "datetime": {"$date": "2021-08-01T23:17:33.526Z"},
         "responseTimesMillis": [78, 67, 107, 110]},
        {"testRun": 5, "datetime": {"$date": "2021-08-01T23:24:39.998Z"},
         "responseTimesMillis": [75, 91, 75, 87, 99, 88, 55, 72, 99, 102]},
        {"testRun": 6, "datetime": {"$date": "2021-08-01T23:27:52.272Z"},
         "responseTimesMillis": [88, 89]},
        {"testRun": 7, "datetime": {"$date": "2021-08-01T23:31:59.917Z"},
         "responseTimesMillis": [101]}
    ]);
    let out = run(
        results,
        json!([
            {"$set": {
                "sortedResponseTimesMillis": sort_array("$responseTimesMillis"),
                "medianTimeMillis": percentile("$responseTimesMillis", 50),
                "ninetiethPercentileTimeMillis": percentile("$responseTimesMillis", 90)
            }},
            {"$match": {"ninetiethPercentileTimeMillis": {"$gt": 100}}},
            {"$unset": ["_id", "datetime", "responseTimesMillis"]}
        ]),
    );
    assert_eq!(
        out,
        docs(json!([
            {"testRun": 1, "sortedResponseTimesMillis": [59, 62, 62, 71, 82, 87, 97, 97, 104, 115],
             "medianTimeMillis": 82, "ninetiethPercentileTimeMillis": 104},
            {"testRun": 2, "sortedResponseTimesMillis": [34, 51, 51, 58, 59, 63, 63, 64, 65, 65, 69, 73, 78, 86, 87, 87, 93, 104, 105, 106, 108],
             "medianTimeMillis": 69, "ninetiethPercentileTimeMillis": 105},
            {"testRun": 3, "sortedResponseTimesMillis": [56, 72, 83, 83, 85, 95, 107],
             "medianTimeMillis": 83, "ninetiethPercentileTimeMillis": 107},
            {"testRun": 4, "sortedResponseTimesMillis": [67, 78, 107, 110],
             "medianTimeMillis": 78, "ninetiethPercentileTimeMillis": 110},
            {"testRun": 7, "sortedResponseTimesMillis": [101],
             "medianTimeMillis": 101, "ninetiethPercentileTimeMillis": 101}
        ]))
    );
}

#[test]
fn unwind_preserves_empty_arrays_as_null() {
    let out = run(
        json!([{"_id": 1, "sizes": []}]),
        json!([{"$unwind": {"path": "$sizes", "preserveNullAndEmptyArrays": true}}]),
    );
    assert_eq!(out, docs(json!([{"_id": 1, "sizes": null}])));
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[test]
fn running_totals_per_store() {
    let out = run(
        json!([
            {"store": "A", "day": 1, "sales": 10},
            {"store": "B", "day": 1, "sales": 4},
            {"store": "A", "day": 2, "sales": 5},
            {"store": "B", "day": 2, "sales": 6},
            {"store": "A", "day": 3, "sales": 1}
        ]),
        json!([
            {"$setWindowFields": {
                "partitionBy": "$store",
                "sortBy": {"day": 1},
                "output": {
                    "runningTotal": {"$sum": "$sales", "window": {"documents": ["unbounded", "current"]}},
                    "rank": {"$rank": {}}
                }
            }},
            {"$project": {"_id": 0, "store": 1, "day": 1, "runningTotal": 1, "rank": 1}}
        ]),
    );
    assert_eq!(
        out,
        docs(json!([
            {"store": "A", "day": 1, "runningTotal": 10, "rank": 1},
            {"store": "A", "day": 2, "runningTotal": 15, "rank": 2},
            {"store": "A", "day": 3, "runningTotal": 16, "rank": 3},
            {"store": "B", "day": 1, "runningTotal": 4, "rank": 1},
            {"store": "B", "day": 2, "runningTotal": 10, "rank": 2}
        ]))
    );
}

// ---------------------------------------------------------------------------
// Execution model
// ---------------------------------------------------------------------------

#[test]
fn sort_then_limit_matches_full_sort() {
    let input = json!([{"n": 5}, {"n": 3}, {"n": 9}, {"n": 1}, {"n": 7}]);
    let full = run(input.clone(), json!([{"$sort": {"n": 1}}]));
    let limited = run(input, json!([{"$sort": {"n": 1}}, {"$limit": 2}]));
    assert_eq!(limited, full[..2].to_vec());
}

#[test]
fn pipeline_is_reusable_across_streams() {
    let pipeline = Pipeline::parse(&v(json!([{"$match": {"ok": true}}, {"$count": "n"}])), Options::default()).unwrap();
    for size in [1usize, 4] {
        let input = (0..size).map(|i| v(json!({"ok": i % 2 == 0})));
        let out = pipeline.stream(Lazy::from_values(input)).value().unwrap();
        assert_eq!(out, docs(json!([{"n": size.div_ceil(2)}])));
    }
}

#[test]
fn unknown_operators_are_errors() {
    let opts = Options::default();
    let err = aggregate(vec![], &v(json!([{"$project": {"x": {"$nope": 1}}}])), &opts).unwrap_err();
    assert!(matches!(err, Error::UnknownOperator { category: OperatorCategory::Expression, .. }));

    let err = aggregate(vec![], &v(json!([{"$match": {"a": {"$nope": 1}}}])), &opts).unwrap_err();
    assert!(matches!(err, Error::UnknownOperator { category: OperatorCategory::Query, .. }));

    let err = aggregate(vec![], &v(json!([{"$bogus": {}}])), &opts).unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
}

#[test]
fn custom_operators_plug_into_pipelines() {
    use std::sync::Arc;

    use oxiflow::{Context, Env, Expression};

    let mut ctx = Context::with_defaults();
    ctx.add_expression_operator(
        "$double",
        Arc::new(|doc: &Value, args: &Expression, env: &Env<'_>| -> oxiflow::Result<Value> {
            let n = args.evaluate(doc, env)?.as_i64().unwrap_or(0);
            Ok(Value::Int(n * 2))
        }),
    );
    let opts = Options::default().with_context(ctx);
    let out = aggregate(docs(json!([{"a": 21}])), &v(json!([{"$project": {"_id": 0, "b": {"$double": "$a"}}}])), &opts)
        .unwrap();
    assert_eq!(out, docs(json!([{"b": 42}])));
}
