mod table_scenarios;
