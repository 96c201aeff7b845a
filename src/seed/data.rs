use crate::model::Id;
use crate::store::{NewAttribute, ParameterInput, Store};
use anyhow::{Context, Result};

/// Ids of the demonstration graph, for callers that want to poke at it
#[derive(Debug, Clone)]
pub struct SeedData {
    pub visibility_area_id: Id,
    pub address_list_id: Id,
    pub person_list_id: Id,
    pub city_attribute_id: Id,
    pub street_attribute_id: Id,
    pub name_attribute_id: Id,
    pub address_attribute_id: Id,
    pub home_id: Id,
    pub office_id: Id,
    pub alice_id: Id,
    pub bob_id: Id,
}

/// Person/Address demonstration data.
///
/// `alice` and `bob` both live at `home` (city Paris). `alice` carries an
/// override for `address -> city` set to Lyon, so resolving that path gives
/// Lyon for alice and Paris for bob while `home` itself is untouched.
pub async fn load_seed_data<S: Store>(store: &S) -> Result<SeedData> {
    let user = Some("system".to_string());

    let area = store
        .create_visibility_area("Demo")
        .await
        .context("Failed to create visibility area")?;

    let address = store
        .create_data_set_list(&area.id, "Address", None, user.clone())
        .await
        .context("Failed to create Address list")?;
    let city = store.create_attribute(&address.id, NewAttribute::text("city")).await?;
    let street = store.create_attribute(&address.id, NewAttribute::text("street")).await?;

    let person = store
        .create_data_set_list(&area.id, "Person", None, user)
        .await
        .context("Failed to create Person list")?;
    let name = store.create_attribute(&person.id, NewAttribute::text("name")).await?;
    let address_attribute = store
        .create_attribute(&person.id, NewAttribute::reference("address", address.id))
        .await?;

    let home = store.create_data_set(&address.id, "home").await?;
    store
        .set_parameter(&home.id, &city.id, ParameterInput::Text("Paris".into()))
        .await?;
    store
        .set_parameter(&home.id, &street.id, ParameterInput::Text("Rue de Rivoli".into()))
        .await?;

    let office = store.create_data_set(&address.id, "office").await?;
    store
        .set_parameter(&office.id, &city.id, ParameterInput::Text("Marseille".into()))
        .await?;

    let alice = store.create_data_set(&person.id, "alice").await?;
    let bob = store.create_data_set(&person.id, "bob").await?;
    for (row, display) in [(&alice, "Alice"), (&bob, "Bob")] {
        store
            .set_parameter(&row.id, &name.id, ParameterInput::Text(display.into()))
            .await?;
        store
            .set_parameter(&row.id, &address_attribute.id, ParameterInput::DataSetRef(home.id))
            .await?;
    }

    store
        .set_override(
            &alice.id,
            &city.id,
            &[address_attribute.id],
            ParameterInput::Text("Lyon".into()),
        )
        .await
        .context("Failed to set demo override")?;

    log::info!(
        "seed data loaded: Person list {} and Address list {} in area {}",
        person.id,
        address.id,
        area.id
    );

    Ok(SeedData {
        visibility_area_id: area.id,
        address_list_id: address.id,
        person_list_id: person.id,
        city_attribute_id: city.id,
        street_attribute_id: street.id,
        name_attribute_id: name.id,
        address_attribute_id: address_attribute.id,
        home_id: home.id,
        office_id: office.id,
        alice_id: alice.id,
        bob_id: bob.id,
    })
}
