use datasets_db_rust::cache::{CacheMode, IdentityCache};
use datasets_db_rust::logic::{GraphBuilder, ValueSource};
use datasets_db_rust::model::Id;
use datasets_db_rust::seed::{load_seed_data, SeedData};
use datasets_db_rust::store::{
    AttributeStore, DataSetListStore, DataSetStore, MemoryStore, NewAttribute, ParameterInput, ParameterStore,
    VisibilityAreaStore,
};
use std::sync::Arc;

async fn seeded() -> (Arc<MemoryStore>, SeedData) {
    let store = Arc::new(MemoryStore::new());
    let seed = load_seed_data(&*store).await.unwrap();
    (store, seed)
}

fn builder(store: &Arc<MemoryStore>) -> GraphBuilder {
    GraphBuilder::new(store.clone())
}

fn city_of(store: &Arc<MemoryStore>, seed: &SeedData, person: &str) -> Option<String> {
    let graph = builder(store).build(&seed.person_list_id).unwrap().unwrap();
    graph
        .resolve_by_name(person, &["address"], "city")
        .unwrap()
        .unwrap()
        .text()
        .map(str::to_string)
}

#[tokio::test]
async fn test_paris_without_override() {
    let (store, seed) = seeded().await;
    let graph = builder(&store).build(&seed.person_list_id).unwrap().unwrap();

    let resolved = graph.resolve_by_name("bob", &["address"], "city").unwrap().unwrap();
    assert_eq!(resolved.text(), Some("Paris"));
    assert_eq!(resolved.source, ValueSource::Natural { data_set_id: seed.home_id });
}

#[tokio::test]
async fn test_override_shadows_only_its_row() {
    let (store, seed) = seeded().await;
    let graph = builder(&store).build(&seed.person_list_id).unwrap().unwrap();

    let alice = graph.resolve_by_name("alice", &["address"], "city").unwrap().unwrap();
    assert_eq!(alice.text(), Some("Lyon"));
    assert!(alice.is_override());

    let bob = graph.resolve_by_name("bob", &["address"], "city").unwrap().unwrap();
    assert_eq!(bob.text(), Some("Paris"));

    // The shared row itself keeps its natural value
    let home = graph
        .data_set(&seed.alice_id)
        .unwrap()
        .parameter(&seed.address_attribute_id)
        .unwrap()
        .referenced_data_set()
        .unwrap()
        .unwrap();
    assert_eq!(home.id, seed.home_id);
    assert_eq!(
        home.parameter(&seed.city_attribute_id).unwrap().value.as_text(),
        Some("Paris")
    );
}

#[tokio::test]
async fn test_shared_row_built_once() {
    let store = Arc::new(MemoryStore::new());
    let area = store.create_visibility_area("Shared").await.unwrap();
    let address = store.create_data_set_list(&area.id, "Address", None, None).await.unwrap();
    let city = store.create_attribute(&address.id, NewAttribute::text("city")).await.unwrap();
    let person = store.create_data_set_list(&area.id, "Person", None, None).await.unwrap();
    let shipping = store
        .create_attribute(&person.id, NewAttribute::reference("shipping", address.id))
        .await
        .unwrap();
    let billing = store
        .create_attribute(&person.id, NewAttribute::reference("billing", address.id))
        .await
        .unwrap();

    let home = store.create_data_set(&address.id, "home").await.unwrap();
    store
        .set_parameter(&home.id, &city.id, ParameterInput::Text("Paris".into()))
        .await
        .unwrap();
    for name in ["alice", "bob"] {
        let row = store.create_data_set(&person.id, name).await.unwrap();
        for attribute in [&shipping, &billing] {
            store
                .set_parameter(&row.id, &attribute.id, ParameterInput::DataSetRef(home.id))
                .await
                .unwrap();
        }
    }

    let graph = builder(&store).build(&person.id).unwrap().unwrap();
    let mut seen = Vec::new();
    for row in graph.root().data_sets() {
        for attribute in [&shipping, &billing] {
            let target = row
                .parameter(&attribute.id)
                .unwrap()
                .referenced_data_set()
                .unwrap()
                .unwrap();
            seen.push(target);
        }
    }

    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|row| Arc::ptr_eq(row, &seen[0])));
    assert_eq!(graph.loaded_lists().len(), 2);
}

#[tokio::test]
async fn test_nearest_override_across_two_hops() {
    let store = Arc::new(MemoryStore::new());
    let area = store.create_visibility_area("Geo").await.unwrap();
    let country = store.create_data_set_list(&area.id, "Country", None, None).await.unwrap();
    let country_name = store.create_attribute(&country.id, NewAttribute::text("name")).await.unwrap();
    let address = store.create_data_set_list(&area.id, "Address", None, None).await.unwrap();
    let in_country = store
        .create_attribute(&address.id, NewAttribute::reference("country", country.id))
        .await
        .unwrap();
    let person = store.create_data_set_list(&area.id, "Person", None, None).await.unwrap();
    let lives_at = store
        .create_attribute(&person.id, NewAttribute::reference("address", address.id))
        .await
        .unwrap();

    let france = store.create_data_set(&country.id, "france").await.unwrap();
    store
        .set_parameter(&france.id, &country_name.id, ParameterInput::Text("France".into()))
        .await
        .unwrap();
    let home = store.create_data_set(&address.id, "home").await.unwrap();
    store
        .set_parameter(&home.id, &in_country.id, ParameterInput::DataSetRef(france.id))
        .await
        .unwrap();
    let mut people: Vec<Id> = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let row = store.create_data_set(&person.id, name).await.unwrap();
        store
            .set_parameter(&row.id, &lives_at.id, ParameterInput::DataSetRef(home.id))
            .await
            .unwrap();
        people.push(row.id);
    }

    // Deeper override on the shared address, nearer one on alice only
    store
        .set_override(&home.id, &country_name.id, &[in_country.id], ParameterInput::Text("Gaul".into()))
        .await
        .unwrap();
    store
        .set_override(
            &people[0],
            &country_name.id,
            &[lives_at.id, in_country.id],
            ParameterInput::Text("Frankreich".into()),
        )
        .await
        .unwrap();

    let graph = builder(&store).build(&person.id).unwrap().unwrap();
    let chain = [lives_at.id, in_country.id];

    let alice = graph.resolve(&people[0], &country_name.id, &chain).unwrap().unwrap();
    assert_eq!(alice.text(), Some("Frankreich"));
    assert_eq!(
        alice.source,
        ValueSource::Override {
            hop: 0,
            data_set_id: people[0]
        }
    );

    let bob = graph.resolve(&people[1], &country_name.id, &chain).unwrap().unwrap();
    assert_eq!(bob.text(), Some("Gaul"));
    assert_eq!(
        bob.source,
        ValueSource::Override {
            hop: 1,
            data_set_id: home.id
        }
    );
}

#[tokio::test]
async fn test_round_trip_set_and_clear() {
    let (store, seed) = seeded().await;

    store
        .set_override(
            &seed.bob_id,
            &seed.city_attribute_id,
            &[seed.address_attribute_id],
            ParameterInput::Text("Nice".into()),
        )
        .await
        .unwrap();
    assert_eq!(city_of(&store, &seed, "bob").as_deref(), Some("Nice"));

    let cleared = store
        .clear_override(&seed.bob_id, &seed.city_attribute_id, &[seed.address_attribute_id])
        .await
        .unwrap();
    assert!(cleared);
    assert_eq!(city_of(&store, &seed, "bob").as_deref(), Some("Paris"));
    assert!(store.list_paths(&seed.bob_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_override_reuses_path() {
    let (store, seed) = seeded().await;
    let chain = [seed.address_attribute_id];

    let before = store
        .get_override_path(&seed.alice_id, &seed.city_attribute_id, &chain)
        .await
        .unwrap()
        .unwrap();
    store
        .set_override(&seed.alice_id, &seed.city_attribute_id, &chain, ParameterInput::Text("Lille".into()))
        .await
        .unwrap();

    let paths = store.list_paths(&seed.alice_id).await.unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].id, before.id);
    assert_eq!(city_of(&store, &seed, "alice").as_deref(), Some("Lille"));
}

#[tokio::test]
async fn test_deleting_chain_attribute_removes_overrides() {
    let (store, seed) = seeded().await;
    assert_eq!(store.list_paths(&seed.alice_id).await.unwrap().len(), 1);

    assert!(store.delete_attribute(&seed.address_attribute_id).await.unwrap());

    assert!(store.list_paths(&seed.alice_id).await.unwrap().is_empty());
    let graph = builder(&store).build(&seed.person_list_id).unwrap().unwrap();
    let alice = graph.data_set(&seed.alice_id).unwrap();
    assert!(alice.overrides().is_empty());
    assert!(graph.root().attribute_by_name("address").is_none());
}

#[tokio::test]
async fn test_deleting_target_attribute_removes_overrides() {
    let (store, seed) = seeded().await;

    assert!(store.delete_attribute(&seed.city_attribute_id).await.unwrap());

    assert!(store.list_paths(&seed.alice_id).await.unwrap().is_empty());
    let graph = builder(&store).build(&seed.person_list_id).unwrap().unwrap();
    assert!(graph.resolve_by_name("alice", &["address"], "city").unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_cache_still_resolves() {
    let (store, seed) = seeded().await;
    let graph = builder(&store)
        .with_cache_mode(CacheMode::Disabled)
        .build(&seed.person_list_id)
        .unwrap()
        .unwrap();

    let alice = graph.resolve_by_name("alice", &["address"], "city").unwrap().unwrap();
    assert_eq!(alice.text(), Some("Lyon"));
    let bob = graph.resolve_by_name("bob", &["address"], "city").unwrap().unwrap();
    assert_eq!(bob.text(), Some("Paris"));
}

#[tokio::test]
async fn test_weak_cache_reused_while_graph_alive() {
    let (store, seed) = seeded().await;
    let shared = Arc::new(IdentityCache::new(CacheMode::Weak));
    let builder = builder(&store).with_shared_cache(shared.clone());

    let first = builder.build(&seed.person_list_id).unwrap().unwrap();
    let second = builder.build(&seed.person_list_id).unwrap().unwrap();
    assert!(Arc::ptr_eq(first.root(), second.root()));

    drop(first);
    drop(second);
    let third = builder.build(&seed.person_list_id).unwrap().unwrap();
    let bob = third.resolve_by_name("bob", &["address"], "city").unwrap().unwrap();
    assert_eq!(bob.text(), Some("Paris"));
}

#[tokio::test]
async fn test_missing_list_builds_nothing() {
    let (store, _) = seeded().await;
    assert!(builder(&store).build(&datasets_db_rust::model::generate_id()).unwrap().is_none());
}

#[tokio::test]
async fn test_deleting_referenced_row_removes_override_path() {
    let store = Arc::new(MemoryStore::new());
    let area = store.create_visibility_area("Geo").await.unwrap();
    let country = store.create_data_set_list(&area.id, "Country", None, None).await.unwrap();
    let address = store.create_data_set_list(&area.id, "Address", None, None).await.unwrap();
    let in_country = store
        .create_attribute(&address.id, NewAttribute::reference("country", country.id))
        .await
        .unwrap();
    let person = store.create_data_set_list(&area.id, "Person", None, None).await.unwrap();
    let lives_at = store
        .create_attribute(&person.id, NewAttribute::reference("address", address.id))
        .await
        .unwrap();

    let france = store.create_data_set(&country.id, "france").await.unwrap();
    let germany = store.create_data_set(&country.id, "germany").await.unwrap();
    let home = store.create_data_set(&address.id, "home").await.unwrap();
    store
        .set_parameter(&home.id, &in_country.id, ParameterInput::DataSetRef(france.id))
        .await
        .unwrap();
    let alice = store.create_data_set(&person.id, "alice").await.unwrap();
    store
        .set_parameter(&alice.id, &lives_at.id, ParameterInput::DataSetRef(home.id))
        .await
        .unwrap();
    store
        .set_override(&alice.id, &in_country.id, &[lives_at.id], ParameterInput::DataSetRef(germany.id))
        .await
        .unwrap();
    assert_eq!(store.list_paths(&alice.id).await.unwrap().len(), 1);

    assert!(store.delete_data_set(&germany.id).await.unwrap());

    assert!(store.list_paths(&alice.id).await.unwrap().is_empty());
    let graph = builder(&store).build(&person.id).unwrap().unwrap();
    assert!(graph.data_set(&alice.id).unwrap().overrides().is_empty());
    let resolved = graph.resolve(&alice.id, &in_country.id, &[lives_at.id]).unwrap().unwrap();
    assert_eq!(resolved.source, ValueSource::Natural { data_set_id: home.id });
}

#[tokio::test]
async fn test_deleting_list_value_removes_override_path() {
    let (store, seed) = seeded().await;
    let kind = store
        .create_attribute(&seed.address_list_id, NewAttribute::list("kind", &["flat", "house"]))
        .await
        .unwrap();
    let options = store.list_values(&kind.id).await.unwrap();
    let house = options.iter().find(|option| option.text == "house").unwrap();

    store
        .set_override(
            &seed.bob_id,
            &kind.id,
            &[seed.address_attribute_id],
            ParameterInput::ListValue(house.id),
        )
        .await
        .unwrap();
    assert_eq!(store.list_paths(&seed.bob_id).await.unwrap().len(), 1);

    assert!(store.delete_list_value(&house.id).await.unwrap());

    assert!(store.list_paths(&seed.bob_id).await.unwrap().is_empty());
    // Alice's override on another attribute is untouched
    assert_eq!(store.list_paths(&seed.alice_id).await.unwrap().len(), 1);
}
